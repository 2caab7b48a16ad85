use std::sync::Arc;

use crate::error::TaskError;
use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::task::{TaskState, TaskToken};

/// Answer to a single status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Still pending or running; poll again at `location`.
    Accepted {
        state: TaskState,
        location: String,
    },
    Completed(serde_json::Value),
    Failed(TaskError),
    /// Never issued, already retrieved under auto-delete, or expired.
    NotFound,
}

/// Consumer-facing view of the task registry.
#[derive(Debug, Clone)]
pub struct StatusService {
    registry: Arc<TaskRegistry>,
    auto_delete: bool,
}

impl StatusService {
    pub fn new(registry: Arc<TaskRegistry>, auto_delete: bool) -> Self {
        Self {
            registry,
            auto_delete,
        }
    }

    /// Path of the status resource for `token`.
    pub fn location(token: &TaskToken) -> String {
        format!("/status/{}", token)
    }

    /// With auto-delete on, the first poller to see a terminal task takes
    /// it; every later (or concurrently losing) poll gets `NotFound`.
    pub async fn poll(&self, token: &TaskToken) -> PollOutcome {
        let Some(task) = self.registry.observe(token, self.auto_delete).await else {
            tracing::debug!(token = %token, "Poll for unknown task");
            return PollOutcome::NotFound;
        };

        match task.state {
            TaskState::Pending | TaskState::Running => PollOutcome::Accepted {
                state: task.state,
                location: Self::location(token),
            },
            TaskState::Completed => {
                tracing::info!(token = %token, label = %task.label, deleted = self.auto_delete, "Task result retrieved");
                PollOutcome::Completed(task.result.unwrap_or(serde_json::Value::Null))
            }
            TaskState::Failed => {
                tracing::info!(token = %token, label = %task.label, deleted = self.auto_delete, "Task failure retrieved");
                PollOutcome::Failed(
                    task.error
                        .unwrap_or_else(|| TaskError::Work("task failed without an error".into())),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn completed_task(registry: &TaskRegistry) -> TaskToken {
        let token = registry.create("t").await.unwrap();
        registry.mark_running(&token).await.unwrap();
        registry.complete(&token, json!({"version": "15.8"})).await.unwrap();
        token
    }

    #[tokio::test]
    async fn running_task_is_accepted_with_location() {
        let registry = Arc::new(TaskRegistry::new());
        let status = StatusService::new(registry.clone(), true);
        let token = registry.create("t").await.unwrap();
        registry.mark_running(&token).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                status.poll(&token).await,
                PollOutcome::Accepted {
                    state: TaskState::Running,
                    location: format!("/status/{}", token),
                }
            );
        }
        assert_eq!(registry.get(&token).await.unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn auto_delete_hands_out_result_once() {
        let registry = Arc::new(TaskRegistry::new());
        let status = StatusService::new(registry.clone(), true);
        let token = completed_task(&registry).await;

        assert_eq!(
            status.poll(&token).await,
            PollOutcome::Completed(json!({"version": "15.8"}))
        );
        assert_eq!(status.poll(&token).await, PollOutcome::NotFound);
    }

    #[tokio::test]
    async fn without_auto_delete_result_is_repeatable() {
        let registry = Arc::new(TaskRegistry::new());
        let status = StatusService::new(registry.clone(), false);
        let token = completed_task(&registry).await;

        for _ in 0..3 {
            assert_eq!(
                status.poll(&token).await,
                PollOutcome::Completed(json!({"version": "15.8"}))
            );
        }
    }

    #[tokio::test]
    async fn failed_task_reports_error() {
        let registry = Arc::new(TaskRegistry::new());
        let status = StatusService::new(registry.clone(), true);
        let token = registry.create("t").await.unwrap();
        registry.mark_running(&token).await.unwrap();
        registry.fail(&token, TaskError::Deadline(10)).await.unwrap();

        assert_eq!(
            status.poll(&token).await,
            PollOutcome::Failed(TaskError::Deadline(10))
        );
        assert_eq!(status.poll(&token).await, PollOutcome::NotFound);
    }

    #[tokio::test]
    async fn unknown_token() {
        let status = StatusService::new(Arc::new(TaskRegistry::new()), true);
        assert_eq!(status.poll(&TaskToken::generate()).await, PollOutcome::NotFound);
    }

    #[tokio::test]
    async fn racing_pollers_first_reader_wins() {
        let registry = Arc::new(TaskRegistry::new());
        let status = StatusService::new(registry.clone(), true);
        let token = completed_task(&registry).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let status = status.clone();
            handles.push(tokio::spawn(async move { status.poll(&token).await }));
        }
        let mut completed = 0;
        let mut not_found = 0;
        for h in handles {
            match h.await.unwrap() {
                PollOutcome::Completed(_) => completed += 1,
                PollOutcome::NotFound => not_found += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(not_found, 15);
    }
}
