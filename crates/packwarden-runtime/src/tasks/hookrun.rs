use async_trait::async_trait;
use packwarden_kube::BindingExecutionInfo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::TaskContext;
use crate::error::Result;
use crate::queue::Task;

/// A hook run triggered by a Kubernetes event, a schedule or an initial
/// synchronization
pub struct HookRunTask {
    ctx: Arc<TaskContext>,
    package: String,
    hook: String,
    info: BindingExecutionInfo,
    id: String,
}

impl HookRunTask {
    pub fn new(ctx: Arc<TaskContext>, package: &str, hook: &str, info: BindingExecutionInfo) -> Self {
        let id = format!("HookRun:{}:{}:{}", package, hook, info.binding);
        Self {
            ctx,
            package: package.to_string(),
            hook: hook.to_string(),
            info,
            id,
        }
    }
}

#[async_trait]
impl Task for HookRunTask {
    fn name(&self) -> &str {
        "HookRun"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(app) = self.ctx.manager.get(&self.package) else {
            tracing::debug!(package = %self.package, hook = %self.hook, "package is gone, skip hook run");
            return Ok(());
        };
        if !app.hooks_initialized() {
            tracing::debug!(package = %self.package, hook = %self.hook, "hooks are disabled, skip hook run");
            return Ok(());
        }

        let result = self
            .ctx
            .manager
            .run_package_hook(&self.package, &self.hook, self.info.contexts.clone(), cancel)
            .await;

        match result {
            Ok(()) => {}
            Err(e) if self.info.allow_failure && !e.is_cancelled() => {
                tracing::warn!(
                    package = %self.package,
                    hook = %self.hook,
                    binding = %self.info.binding,
                    error = %e,
                    "hook failed, failure allowed"
                );
            }
            Err(e) => return Err(e),
        }

        if !self.info.unlock_monitors.is_empty() {
            app.unlock_kubernetes_monitors(&self.hook, &self.info.unlock_monitors);
        }
        Ok(())
    }
}
