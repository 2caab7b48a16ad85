use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::inventory::DeviceInventory;
use crate::scheduler::{StatusService, TaskRegistry};
use crate::session::Connector;
use crate::worker::TaskExecutor;

/// Wires the registry, executor, status service and HTTP API together.
pub struct Service {
    pub config: ServiceConfig,
    pub registry: Arc<TaskRegistry>,
    pub executor: TaskExecutor,
    pub status: StatusService,
    pub inventory: Arc<dyn DeviceInventory>,
    pub connector: Arc<dyn Connector>,
}

impl Service {
    pub fn new(
        config: ServiceConfig,
        inventory: Arc<dyn DeviceInventory>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::with_capacity(config.max_tasks));

        let mut executor = TaskExecutor::new(registry.clone());
        if let Some(limit) = config.max_concurrent_sessions {
            executor = executor.with_concurrency_limit(limit);
        }
        if let Some(deadline) = config.task_deadline {
            executor = executor.with_deadline(deadline);
        }

        let status = StatusService::new(registry.clone(), config.auto_delete_completed_tasks);

        Self {
            config,
            registry,
            executor,
            status,
            inventory,
            connector,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            inventory: self.inventory.clone(),
            connector: self.connector.clone(),
            executor: self.executor.clone(),
            status: self.status.clone(),
            session: Arc::new(self.config.session.clone()),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the expiry sweeper if a completed-task TTL is configured
    /// 2. Serves the HTTP API (blocking) with graceful shutdown
    ///
    /// Tasks still running at shutdown are abandoned; the registry is
    /// in-memory only.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Some(ttl) = self.config.completed_task_ttl {
            let registry = self.registry.clone();
            let interval = self.config.sweep_interval;
            let token = shutdown.clone();
            tokio::spawn(async move {
                Self::sweeper_loop(registry, ttl, interval, token).await;
            });
        }

        tracing::info!(
            auto_delete = self.config.auto_delete_completed_tasks,
            max_tasks = self.config.max_tasks,
            max_concurrent_sessions = ?self.config.max_concurrent_sessions,
            task_deadline = ?self.config.task_deadline,
            "Service starting"
        );

        run_api(self.config.listen_addr, self.api_state(), shutdown).await?;

        let abandoned = self.registry.len().await;
        tracing::info!(abandoned, "Service stopped");
        Ok(())
    }

    /// Periodically drop finished tasks nobody came back for.
    pub async fn sweeper_loop(
        registry: Arc<TaskRegistry>,
        ttl: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.purge_expired(ttl, Utc::now()).await;
                    if removed > 0 {
                        tracing::info!(removed, "Swept expired tasks");
                    }
                }
            }
        }
    }
}
