use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{TaskContext, task_id};
use crate::error::Result;
use crate::queue::Task;

/// One steady-state run cycle of a started package
pub struct RunTask {
    ctx: Arc<TaskContext>,
    package: String,
    id: String,
}

impl RunTask {
    pub fn new(ctx: Arc<TaskContext>, package: &str) -> Self {
        Self {
            ctx,
            package: package.to_string(),
            id: task_id("Run", package),
        }
    }
}

#[async_trait]
impl Task for RunTask {
    fn name(&self) -> &str {
        "Run"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(app) = self.ctx.manager.get(&self.package) else {
            return Ok(());
        };
        if !app.hooks_initialized() {
            tracing::debug!(package = %self.package, "package is not started, skip run");
            return Ok(());
        }

        match self.ctx.manager.run_package(&self.package, cancel).await {
            Ok(()) => {
                self.ctx.status.set_ready(&self.package, app.is_helm_chart()).await;
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
