//! Turns Kubernetes events and fired crontabs into hook run tasks

use packwarden_kube::{KubeEventsManager, ScheduleManager};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::manager::{PackageManager, QueuedTasks, TaskBuilder};
use crate::queue::{EnqueueOptions, QueueService};

pub struct EventHandler {
    manager: Arc<PackageManager>,
    queues: Arc<QueueService>,
    events: Arc<dyn KubeEventsManager>,
    schedules: Arc<ScheduleManager>,
    builder: Arc<TaskBuilder>,
    cancel: CancellationToken,
    started: AtomicBool,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl EventHandler {
    pub fn new(
        manager: Arc<PackageManager>,
        queues: Arc<QueueService>,
        events: Arc<dyn KubeEventsManager>,
        schedules: Arc<ScheduleManager>,
        builder: Arc<TaskBuilder>,
    ) -> Self {
        Self {
            manager,
            queues,
            events,
            schedules,
            builder,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Start the loop; only the first call does anything
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (Some(kube_rx), Some(schedule_rx)) =
            (self.events.take_events(), self.schedules.take_events())
        else {
            tracing::warn!("event streams already taken, event handler not started");
            return;
        };

        let handler = Arc::clone(self);
        let span = tracing::info_span!("event_handler");
        let handle = tokio::spawn(async move { handler.run(kube_rx, schedule_rx).await }.instrument(span));
        *self.handle.lock() = Some(handle);
    }

    async fn run(
        &self,
        mut kube_rx: mpsc::UnboundedReceiver<packwarden_kube::KubeEvent>,
        mut schedule_rx: mpsc::UnboundedReceiver<String>,
    ) {
        tracing::info!("event handler started");
        loop {
            let tasks = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(crontab) = schedule_rx.recv() => {
                    tracing::debug!(crontab = %crontab, "schedule event");
                    self.manager.build_schedule_tasks(&crontab, self.builder.as_ref())
                }
                Some(event) = kube_rx.recv() => {
                    tracing::debug!(monitor = %event.monitor_id, event = ?event.watch_event, "kubernetes event");
                    self.manager.build_kube_tasks(&event, self.builder.as_ref())
                }
                else => break,
            };
            self.enqueue(tasks);
        }
        tracing::info!("event handler stopped");
    }

    fn enqueue(&self, tasks: QueuedTasks) {
        for (queue, tasks) in tasks {
            for task in tasks {
                self.queues
                    .enqueue(&self.cancel, &queue, task, EnqueueOptions::new());
            }
        }
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "event handler task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::hook_task_builder;
    use crate::tasks::testing::harness;
    use packwarden_kube::WatchEventType;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_kube_event_becomes_hook_run() {
        let h = harness();
        h.load().await;
        h.ctx.manager.initialize_hooks("echo").unwrap();
        let mut sync = h.ctx.manager.enable_kubernetes_hooks("echo").await.unwrap();
        let run = sync.remove("echo/hooks/pods").unwrap().remove(0);
        h.ctx
            .manager
            .get("echo")
            .unwrap()
            .unlock_kubernetes_monitors("echo/hooks/pods", &run.unlock_monitors);

        let events: Arc<dyn KubeEventsManager> = h.events.clone();
        let handler = Arc::new(EventHandler::new(
            h.ctx.manager.clone(),
            h.ctx.queues.clone(),
            events,
            Arc::new(ScheduleManager::new()),
            hook_task_builder(h.ctx.clone()),
        ));
        handler.start();
        handler.start();

        h.events.emit(
            WatchEventType::Added,
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p2", "namespace": "default"}}),
        );

        for _ in 0..100 {
            if h.executor.call_count("echo/hooks/pods") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.executor.call_count("echo/hooks/pods"), 1);
        assert!(h.ctx.queues.exists("pods"));

        handler.stop().await;
        h.ctx.queues.stop().await;
    }
}
