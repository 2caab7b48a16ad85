use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{RegistryError, TaskError};
use crate::scheduler::task::{Task, TaskState, TaskToken};

const DEFAULT_MAX_TASKS: usize = 10_000;

/// Process-wide store of task records.
///
/// The map is private; every mutation is a single write-locked update, so a
/// reader always sees one consistent snapshot of a task.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskToken, Task>>,
    max_tasks: usize,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TASKS)
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_tasks,
        }
    }

    /// Mint a fresh token and insert a `Pending` task under it.
    pub async fn create(&self, label: impl Into<String>) -> Result<TaskToken, RegistryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.len() >= self.max_tasks {
            return Err(RegistryError::Full(self.max_tasks));
        }
        let mut token = TaskToken::generate();
        while tasks.contains_key(&token) {
            token = TaskToken::generate();
        }
        tasks.insert(token, Task::new(token, label));
        Ok(token)
    }

    pub async fn mark_running(&self, token: &TaskToken) -> Result<(), RegistryError> {
        self.transition(token, TaskState::Running, |task| {
            task.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn complete(
        &self,
        token: &TaskToken,
        result: serde_json::Value,
    ) -> Result<(), RegistryError> {
        self.transition(token, TaskState::Completed, move |task| {
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn fail(&self, token: &TaskToken, error: TaskError) -> Result<(), RegistryError> {
        self.transition(token, TaskState::Failed, move |task| {
            task.error = Some(error);
            task.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn transition<F>(
        &self,
        token: &TaskToken,
        to: TaskState,
        apply: F,
    ) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(token)
            .ok_or(RegistryError::NotFound(*token))?;

        if task.state.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(*token));
        }
        if !task.state.can_transition_to(to) {
            return Err(RegistryError::IllegalTransition {
                token: *token,
                from: task.state,
                to,
            });
        }

        task.state = to;
        apply(task);
        tracing::debug!(token = %token, label = %task.label, state = %to, "Task state changed");
        Ok(())
    }

    /// Snapshot of a task, if it exists.
    pub async fn get(&self, token: &TaskToken) -> Option<Task> {
        self.tasks.read().await.get(token).cloned()
    }

    pub async fn delete(&self, token: &TaskToken) -> Option<Task> {
        self.tasks.write().await.remove(token)
    }

    /// Read a task for a poller. When `remove_terminal` is set and the task is
    /// terminal, it is removed under the same lock, so exactly one caller ever
    /// receives it.
    pub async fn observe(&self, token: &TaskToken, remove_terminal: bool) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let terminal = tasks.get(token)?.state.is_terminal();
        if terminal && remove_terminal {
            tasks.remove(token)
        } else {
            tasks.get(token).cloned()
        }
    }

    /// Drop terminal tasks that finished more than `ttl` before `now`.
    /// Returns the number of tasks removed.
    pub async fn purge_expired(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| match (task.state.is_terminal(), task.completed_at) {
            (true, Some(done)) => now.signed_duration_since(done) < ttl,
            _ => true,
        });
        before - tasks.len()
    }

    pub async fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.state == state)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.tasks.read().await.len() >= self.max_tasks
    }
}
