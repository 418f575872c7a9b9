use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{TaskContext, task_id};
use crate::error::Result;
use crate::lifecycle::Phase;
use crate::queue::Task;

/// Load (or reload) a package from disk and register it with the scheduler
pub struct LoadTask {
    ctx: Arc<TaskContext>,
    package: String,
    path: PathBuf,
    namespace: Option<String>,
    id: String,
}

impl LoadTask {
    pub fn new(
        ctx: Arc<TaskContext>,
        package: &str,
        path: impl Into<PathBuf>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            ctx,
            package: package.to_string(),
            path: path.into(),
            namespace,
            id: task_id("Load", package),
        }
    }
}

#[async_trait]
impl Task for LoadTask {
    fn name(&self) -> &str {
        "Load"
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let manager = &self.ctx.manager;

        // A running instance keeps its release but loses its hooks
        if manager.get(&self.package).is_some_and(|app| app.hooks_initialized()) {
            manager.disable_package(&self.package, true, cancel).await?;
        }

        if let Err(e) = manager
            .load_package(&self.package, &self.path, self.namespace.as_deref())
            .await
        {
            self.ctx.status.handle_error(&self.package, &e).await;
            return Err(e);
        }

        self.ctx.lifecycle.set_phase(&self.package, Phase::Loaded);
        if let Some(app) = manager.get(&self.package) {
            self.ctx.scheduler.add_node(app.as_ref());
        }
        Ok(())
    }
}
