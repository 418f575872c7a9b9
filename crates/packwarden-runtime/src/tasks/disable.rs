use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{TaskContext, task_id};
use crate::error::Result;
use crate::queue::Task;

/// Stop a package; without `keep` its release is uninstalled and the
/// package forgotten
pub struct DisableTask {
    ctx: Arc<TaskContext>,
    package: String,
    keep: bool,
    id: String,
}

impl DisableTask {
    pub fn new(ctx: Arc<TaskContext>, package: &str, keep: bool) -> Self {
        Self {
            ctx,
            package: package.to_string(),
            keep,
            id: task_id("Disable", package),
        }
    }
}

#[async_trait]
impl Task for DisableTask {
    fn name(&self) -> &str {
        "Disable"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        if let Err(e) = self
            .ctx
            .manager
            .disable_package(&self.package, self.keep, cancel)
            .await
        {
            self.ctx.status.handle_error(&self.package, &e).await;
            return Err(e);
        }

        if !self.keep {
            self.ctx.status.remove(&self.package);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::StartupTask;
    use crate::tasks::testing::harness;

    #[tokio::test]
    async fn test_disable_keep_then_delete() {
        let h = harness();
        h.load().await;
        let cancel = CancellationToken::new();
        StartupTask::new(h.ctx.clone(), "echo")
            .execute(&cancel)
            .await
            .unwrap();

        DisableTask::new(h.ctx.clone(), "echo", true)
            .execute(&cancel)
            .await
            .unwrap();
        let app = h.ctx.manager.get("echo").unwrap();
        assert!(!app.hooks_initialized());
        assert!(h.helm.release("echo").is_some());
        assert!(!h.ctx.status.get("echo").is_empty());

        DisableTask::new(h.ctx.clone(), "echo", false)
            .execute(&cancel)
            .await
            .unwrap();
        assert!(h.ctx.manager.get("echo").is_none());
        assert_eq!(h.helm.uninstall_count(), 1);
        assert!(h.ctx.status.get("echo").is_empty());
        h.ctx.queues.stop().await;
    }
}
