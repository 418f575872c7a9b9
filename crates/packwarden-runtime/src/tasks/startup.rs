use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{HookRunTask, TaskContext, task_id};
use crate::error::{Result, RuntimeError};
use crate::queue::{EnqueueOptions, Task, WaitGroup};

/// Bring a loaded package up: hooks, initial synchronization, onStartup
/// hooks and the first run cycle
pub struct StartupTask {
    ctx: Arc<TaskContext>,
    package: String,
    id: String,
}

impl StartupTask {
    pub fn new(ctx: Arc<TaskContext>, package: &str) -> Self {
        Self {
            ctx,
            package: package.to_string(),
            id: task_id("Startup", package),
        }
    }

    async fn startup(&self, cancel: &CancellationToken) -> Result<()> {
        let manager = &self.ctx.manager;
        let Some(app) = manager.get(&self.package) else {
            tracing::debug!(package = %self.package, "package is gone, skip startup");
            return Ok(());
        };

        // A retry starts from scratch
        if app.hooks_initialized() {
            app.disable_hooks();
        }

        manager.initialize_hooks(&self.package)?;
        let sync = manager.enable_kubernetes_hooks(&self.package).await?;

        let wait = Arc::new(WaitGroup::new());
        for (hook, runs) in sync {
            for info in runs {
                let queue = app.queue_name(&info.queue);
                let task = HookRunTask::new(Arc::clone(&self.ctx), &self.package, &hook, info);
                if queue == self.package {
                    task.execute(cancel).await?;
                } else {
                    self.ctx.queues.enqueue(
                        cancel,
                        &queue,
                        Arc::new(task),
                        EnqueueOptions::new().wait(Arc::clone(&wait)),
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            _ = wait.wait() => {}
        }

        manager.enable_schedule_hooks(&self.package)?;
        manager.startup_package(&self.package, cancel).await
    }
}

#[async_trait]
impl Task for StartupTask {
    fn name(&self) -> &str {
        "Startup"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        match self.startup(cancel).await {
            Ok(()) => {
                if let Some(app) = self.ctx.manager.get(&self.package) {
                    self.ctx.status.set_ready(&self.package, app.is_helm_chart()).await;
                    tracing::info!(package = %self.package, "package started");
                }
                Ok(())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.ctx.status.handle_error(&self.package, &e).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorReason;
    use crate::status::ConditionType;
    use crate::tasks::testing::harness;

    #[tokio::test]
    async fn test_startup_runs_sync_then_startup_hooks() {
        let h = harness();
        h.load().await;

        StartupTask::new(h.ctx.clone(), "echo")
            .execute(&CancellationToken::new())
            .await
            .unwrap();

        let hooks = h.executor.called_hooks();
        assert_eq!(hooks, vec!["echo/hooks/pods", "echo/hooks/startup"]);
        assert_eq!(h.helm.release("echo").unwrap().revision, 1);
        assert!(
            h.ctx
                .status
                .condition("echo", ConditionType::ReadyInCluster)
                .unwrap()
                .is_true()
        );
        assert!(h.ctx.queues.exists("pods"));
        h.ctx.queues.stop().await;
    }

    #[tokio::test]
    async fn test_startup_hook_failure() {
        let h = harness();
        h.load().await;
        h.executor.set_failing("echo/hooks/startup", Some("exit 1"));

        let err = StartupTask::new(h.ctx.clone(), "echo")
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RuntimeError::Package(e) => assert_eq!(e.reason, ErrorReason::StartupHookFailed),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            h.ctx
                .status
                .condition("echo", ConditionType::HooksProcessed)
                .unwrap()
                .reason,
            "StartupHookFailed"
        );
        assert!(h.helm.release("echo").is_none());
        h.ctx.queues.stop().await;
    }

    #[tokio::test]
    async fn test_startup_of_removed_package_is_skipped() {
        let h = harness();
        StartupTask::new(h.ctx.clone(), "echo")
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert!(h.executor.called_hooks().is_empty());
    }
}
