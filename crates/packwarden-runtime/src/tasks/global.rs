use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::TaskContext;
use crate::error::Result;
use crate::queue::Task;
use crate::scheduler::GLOBAL_NODE;

/// Marks the global node done, releasing the packages waiting on it
pub struct GlobalTask {
    ctx: Arc<TaskContext>,
}

impl GlobalTask {
    pub fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Task for GlobalTask {
    fn name(&self) -> &str {
        "Global"
    }

    async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
        self.ctx.scheduler.complete(GLOBAL_NODE);
        Ok(())
    }
}
