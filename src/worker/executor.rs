use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::error::{RegistryError, TaskError};
use crate::scheduler::{TaskRegistry, TaskToken};

/// Runs submitted work in the background and records its outcome.
///
/// `submit` never waits on the work itself:
/// - a `Pending` task is registered and its token returned straight away
/// - a tokio task waits for a concurrency permit (if limited), marks the task
///   `Running` and drives the work on its own spawned task
/// - the outcome (value, error, panic or deadline) becomes exactly one
///   terminal write
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    permits: Option<Arc<Semaphore>>,
    deadline: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            permits: None,
            deadline: None,
        }
    }

    /// Cap the number of tasks whose work runs at the same time. Tasks over
    /// the cap stay `Pending` until a slot frees up.
    pub fn with_concurrency_limit(mut self, max_running: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(max_running.max(1))));
        self
    }

    /// Fail any task whose work runs longer than `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn submit<F, T>(
        &self,
        label: impl Into<String>,
        work: F,
    ) -> Result<TaskToken, RegistryError>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let label = label.into();
        let token = self.registry.create(label.clone()).await?;
        tracing::info!(token = %token, label = %label, "Task submitted");

        let registry = self.registry.clone();
        let permits = self.permits.clone();
        let deadline = self.deadline;
        tokio::spawn(async move {
            // The semaphore is owned here and never closed, so acquiring only waits.
            let _permit = match permits {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };

            if let Err(e) = registry.mark_running(&token).await {
                tracing::error!(token = %token, error = %e, "Failed to start task");
                return;
            }
            tracing::info!(token = %token, label = %label, "Task started");

            let outcome = Self::drive(work, deadline).await;
            Self::record(&registry, token, &label, outcome).await;
        });

        Ok(token)
    }

    async fn drive<F, T>(work: F, deadline: Option<Duration>) -> Result<serde_json::Value, TaskError>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let mut handle = tokio::spawn(work);
        let joined = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Dropping the work future releases whatever it holds.
                    handle.abort();
                    return Err(TaskError::Deadline(limit.as_millis() as u64));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => serde_json::to_value(value)
                .map_err(|e| TaskError::Work(format!("failed to encode result: {}", e))),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Self::join_failure(e)),
        }
    }

    async fn record(
        registry: &TaskRegistry,
        token: TaskToken,
        label: &str,
        outcome: Result<serde_json::Value, TaskError>,
    ) {
        let written = match outcome {
            Ok(value) => {
                tracing::info!(token = %token, label, "Task completed");
                registry.complete(&token, value).await
            }
            Err(error) => {
                tracing::warn!(token = %token, label, kind = error.kind(), error = %error, "Task failed");
                registry.fail(&token, error).await
            }
        };
        if let Err(e) = written {
            tracing::error!(token = %token, error = %e, "Failed to record task outcome");
        }
    }

    fn join_failure(e: JoinError) -> TaskError {
        if e.is_panic() {
            TaskError::Panicked(panic_message(e.into_panic()))
        } else {
            TaskError::Work("task was cancelled".into())
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
