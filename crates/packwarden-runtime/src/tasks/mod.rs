//! Lifecycle tasks
//!
//! Tasks share one [`TaskContext`] holding the runtime services. All tasks
//! of a package go to the queue named after the package, so its load,
//! startup, runs and disable never overlap.

mod applysettings;
mod disable;
mod global;
mod hookrun;
mod load;
mod run;
mod startup;

pub use applysettings::ApplySettingsTask;
pub use disable::DisableTask;
pub use global::GlobalTask;
pub use hookrun::HookRunTask;
pub use load::LoadTask;
pub use run::RunTask;
pub use startup::StartupTask;

use packwarden_kube::BindingExecutionInfo;
use std::sync::Arc;

use crate::lifecycle::LifecycleStore;
use crate::manager::{PackageManager, TaskBuilder};
use crate::queue::{QueueService, Task};
use crate::scheduler::Scheduler;
use crate::status::StatusService;

/// Services available to every task
pub struct TaskContext {
    pub manager: Arc<PackageManager>,
    pub queues: Arc<QueueService>,
    pub scheduler: Arc<Scheduler>,
    pub status: Arc<StatusService>,
    pub lifecycle: Arc<LifecycleStore>,
}

impl TaskContext {
    /// Queue of a binding run; `main` maps to the package queue
    pub fn hook_queue(&self, package: &str, queue: &str) -> String {
        match self.manager.get(package) {
            Some(app) => app.queue_name(queue),
            None if queue.is_empty() || queue == packwarden_kube::MAIN_QUEUE => package.to_string(),
            None => queue.to_string(),
        }
    }
}

/// Builder turning binding runs into [`HookRunTask`]s on their queues
pub fn hook_task_builder(ctx: Arc<TaskContext>) -> Arc<TaskBuilder> {
    Arc::new(move |package: &str, hook: &str, info: BindingExecutionInfo| {
        let queue = ctx.hook_queue(package, &info.queue);
        let task: Arc<dyn Task> = Arc::new(HookRunTask::new(Arc::clone(&ctx), package, hook, info));
        (queue, task)
    })
}

fn task_id(kind: &str, package: &str) -> String {
    format!("{}:{}", kind, package)
}
