use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{TaskContext, task_id};
use crate::error::Result;
use crate::queue::Task;

/// Apply the latest settings stored for the package
pub struct ApplySettingsTask {
    ctx: Arc<TaskContext>,
    package: String,
    id: String,
}

impl ApplySettingsTask {
    pub fn new(ctx: Arc<TaskContext>, package: &str) -> Self {
        Self {
            ctx,
            package: package.to_string(),
            id: task_id("ApplySettings", package),
        }
    }
}

#[async_trait]
impl Task for ApplySettingsTask {
    fn name(&self) -> &str {
        "ApplySettings"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
        let Some(settings) = self.ctx.lifecycle.pending_settings(&self.package) else {
            return Ok(());
        };

        if let Err(e) = self.ctx.manager.apply_settings(&self.package, settings) {
            self.ctx.status.handle_error(&self.package, &e).await;
            return Err(e);
        }
        tracing::debug!(package = %self.package, "settings applied");
        Ok(())
    }
}
