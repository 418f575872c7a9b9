//! Runtime wiring
//!
//! The [`Operator`] owns the queue service, the scheduler, the package
//! manager and the event handler, and connects their callbacks:
//!
//! ```text
//! update ──► Load ──► scheduler node ──onSchedule──► ApplySettings, Startup ──► complete
//!                                   ──onDisable───► Disable(keep)
//! hook changed values ──────────────────────────► Run (unique)
//! helm resources absent ─────────────────────────► reschedule
//! remove ──► Disable ──► node and queues removed
//! ```

use packwarden_core::Values;
use packwarden_kube::{HelmService, KubeEventsManager, ScheduleManager};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::eventhandler::EventHandler;
use crate::global::GlobalValues;
use crate::lifecycle::{LifecycleEvent, LifecycleStore, Phase};
use crate::manager::{ManagerServices, PackageDump, PackageManager};
use crate::queue::{EnqueueOptions, QueueService, Task};
use crate::scheduler::{GLOBAL_NODE, NodeState, Scheduler, SchedulerConfig};
use crate::status::{Condition, StatusService, StatusSink};
use crate::tasks::{
    ApplySettingsTask, DisableTask, GlobalTask, LoadTask, RunTask, StartupTask, TaskContext,
    hook_task_builder,
};

/// Queue of the global node task
pub const GLOBAL_QUEUE: &str = "global";

#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    /// Unix socket of the debug server; no server when unset
    pub debug_socket: Option<PathBuf>,
}

/// A package as found on disk
#[derive(Debug, Clone, Default)]
pub struct PackageUpdate {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    /// Settings from the package configuration, if any
    pub settings: Option<Values>,
    /// Namespace override
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageReport {
    #[serde(flatten)]
    package: PackageDump,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<NodeState>,
    conditions: Vec<Condition>,
}

pub struct Operator {
    ctx: Arc<TaskContext>,
    helm: Arc<HelmService>,
    events: Arc<dyn KubeEventsManager>,
    schedules: Arc<ScheduleManager>,
    global: Arc<GlobalValues>,
    event_handler: Arc<EventHandler>,
    config: OperatorConfig,
    cancel: CancellationToken,
    debug: Mutex<Option<JoinHandle<()>>>,
}

impl Operator {
    pub fn new(services: ManagerServices, config: OperatorConfig) -> Self {
        let global = Arc::clone(&services.global);
        let scheduler_config = {
            let kube = Arc::clone(&global);
            let platform = Arc::clone(&global);
            let bootstrap = Arc::clone(&global);
            SchedulerConfig::new()
                .kubernetes_version(Arc::new(move || kube.kubernetes_version()))
                .platform_version(Arc::new(move || platform.platform_version()))
                .bootstrap(Arc::new(move || bootstrap.is_bootstrapped()))
        };

        let helm = Arc::clone(&services.helm);
        let events = Arc::clone(&services.events);
        let schedules = Arc::clone(&services.schedules);

        let ctx = Arc::new(TaskContext {
            manager: Arc::new(PackageManager::new(services)),
            queues: Arc::new(QueueService::new()),
            scheduler: Arc::new(Scheduler::new(scheduler_config)),
            status: Arc::new(StatusService::new()),
            lifecycle: Arc::new(LifecycleStore::new()),
        });

        let event_handler = Arc::new(EventHandler::new(
            Arc::clone(&ctx.manager),
            Arc::clone(&ctx.queues),
            Arc::clone(&events),
            Arc::clone(&schedules),
            hook_task_builder(Arc::clone(&ctx)),
        ));

        let operator = Self {
            ctx,
            helm,
            events,
            schedules,
            global,
            event_handler,
            config,
            cancel: CancellationToken::new(),
            debug: Mutex::new(None),
        };
        operator.wire();
        operator
    }

    /// Callbacks hold weak references so the context does not own itself
    fn wire(&self) {
        let weak = Arc::downgrade(&self.ctx);

        let ctx = weak.clone();
        self.ctx.scheduler.on_schedule(move |name| {
            if let Some(ctx) = ctx.upgrade() {
                on_schedule(&ctx, name);
            }
        });

        let ctx = weak.clone();
        self.ctx.scheduler.on_disable(move |name| {
            if let Some(ctx) = ctx.upgrade() {
                on_disable(&ctx, name);
            }
        });

        self.ctx.scheduler.on_global_done(|enabled| {
            tracing::info!(enabled = enabled.len(), packages = ?enabled, "global node done");
        });

        let ctx = weak.clone();
        self.ctx.manager.on_values_changed(move |name| {
            if let Some(ctx) = ctx.upgrade() {
                on_values_changed(&ctx, name);
            }
        });

        let ctx = weak;
        self.helm.set_absent_callback(Arc::new(move |name: &str| {
            if let Some(ctx) = ctx.upgrade() {
                tracing::info!(package = %name, "release resources are absent, reschedule");
                ctx.scheduler.reschedule(name);
            }
        }));
    }

    /// Start background processing and the debug server
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.schedules.start();
        self.event_handler.start();

        if let Some(path) = &self.config.debug_socket {
            let listener = crate::debug::bind(path)?;
            let router = crate::debug::router(Arc::clone(self));
            let cancel = self.cancel.child_token();
            let path = path.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = crate::debug::serve(listener, &path, router, cancel).await {
                    tracing::error!(error = %e, "debug server failed");
                }
            });
            *self.debug.lock() = Some(handle);
        }

        tracing::info!("operator started");
        Ok(())
    }

    /// Register a package found on disk, or refresh it.
    ///
    /// A new package or a new version is (re)loaded. Otherwise only changed
    /// settings are taken into account.
    pub fn update(&self, update: PackageUpdate) {
        let ctx = &self.ctx;
        let name = update.name.as_str();

        let reload = ctx.lifecycle.version(name).as_deref() != Some(update.version.as_str())
            || ctx.lifecycle.phase(name).is_none();

        if reload {
            let cancel = ctx.lifecycle.renew(name, LifecycleEvent::Update);
            ctx.lifecycle.set_version(name, &update.version);
            if let Some(settings) = update.settings {
                ctx.lifecycle.set_pending_settings(name, settings);
            }

            tracing::info!(package = %name, version = %update.version, "load package");
            let task = LoadTask::new(Arc::clone(ctx), name, update.path, update.namespace);
            ctx.queues
                .enqueue(&cancel, name, Arc::new(task), EnqueueOptions::new());
            return;
        }

        let Some(settings) = update.settings else {
            return;
        };
        let changed = ctx.manager.get(name).is_none() || ctx.manager.settings_changed(name, &settings);
        ctx.lifecycle.set_pending_settings(name, settings);
        if !changed {
            return;
        }

        if ctx.lifecycle.phase(name) == Some(Phase::Running) {
            tracing::info!(package = %name, "settings changed, run package");
            let cancel = ctx.lifecycle.token(name).unwrap_or_default();
            ctx.queues.enqueue(
                &cancel,
                name,
                Arc::new(ApplySettingsTask::new(Arc::clone(ctx), name)),
                EnqueueOptions::new(),
            );
            ctx.queues.enqueue(
                &cancel,
                name,
                Arc::new(RunTask::new(Arc::clone(ctx), name)),
                EnqueueOptions::new().unique(),
            );
        }
    }

    /// Uninstall a package and forget it
    pub fn remove(&self, name: &str) {
        let ctx = &self.ctx;
        let queues = ctx.manager.get_package_queues(name);
        let cancel = ctx.lifecycle.renew(name, LifecycleEvent::Delete);

        tracing::info!(package = %name, "remove package");
        let weak = Arc::downgrade(ctx);
        let package = name.to_string();
        ctx.queues.enqueue(
            &cancel,
            name,
            Arc::new(DisableTask::new(Arc::clone(ctx), name, false)),
            EnqueueOptions::new().on_done(move || {
                if let Some(ctx) = weak.upgrade() {
                    ctx.scheduler.remove_node(&package);
                    ctx.lifecycle.remove(&package);
                    for queue in queues {
                        ctx.queues.remove(&queue);
                    }
                }
            }),
        );
    }

    /// Stop everything, event sources first
    pub async fn stop(&self) {
        tracing::info!("stop operator");
        self.helm.stop_monitors();
        self.schedules.stop();
        self.events.stop();
        self.event_handler.stop().await;
        self.ctx.queues.stop().await;
        self.ctx.scheduler.pause();
        self.ctx.lifecycle.cancel_all();

        self.cancel.cancel();
        let debug = self.debug.lock().take();
        if let Some(handle) = debug {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "debug server task failed");
            }
        }
        tracing::info!("operator stopped");
    }

    pub fn add_status_sink(&self, sink: Arc<dyn StatusSink>) {
        self.ctx.status.add_sink(sink);
    }

    pub fn manager(&self) -> &Arc<PackageManager> {
        &self.ctx.manager
    }

    pub fn queues(&self) -> &Arc<QueueService> {
        &self.ctx.queues
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.ctx.scheduler
    }

    pub fn status(&self) -> &Arc<StatusService> {
        &self.ctx.status
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleStore> {
        &self.ctx.lifecycle
    }

    pub fn global(&self) -> &Arc<GlobalValues> {
        &self.global
    }

    /// YAML report of packages with their phase, node state and conditions
    pub fn packages_dump(&self) -> Result<String> {
        let reports: Vec<PackageReport> = self
            .ctx
            .manager
            .snapshot()
            .into_iter()
            .map(|package| {
                let name = package.name.clone();
                PackageReport {
                    phase: self.ctx.lifecycle.phase(&name),
                    node: self.ctx.scheduler.state(&name),
                    conditions: self.ctx.status.get(&name),
                    package,
                }
            })
            .collect();
        Ok(serde_yaml::to_string(&reports)?)
    }

    pub fn queues_dump(&self) -> Result<String> {
        self.ctx.queues.dump()
    }

    pub fn scheduler_dump(&self) -> Result<String> {
        self.ctx.scheduler.dump()
    }

    pub async fn render(&self, name: &str) -> Result<String> {
        self.ctx.manager.render(name).await
    }
}

fn on_schedule(ctx: &Arc<TaskContext>, name: &str) {
    if name == GLOBAL_NODE {
        ctx.queues.enqueue(
            &CancellationToken::new(),
            GLOBAL_QUEUE,
            Arc::new(GlobalTask::new(Arc::clone(ctx))),
            EnqueueOptions::new().unique(),
        );
        return;
    }

    match ctx.lifecycle.phase(name) {
        Some(Phase::Loaded) => {
            let cancel = ctx.lifecycle.renew(name, LifecycleEvent::Schedule);
            tracing::info!(package = %name, "start package");
            ctx.queues.enqueue(
                &cancel,
                name,
                Arc::new(ApplySettingsTask::new(Arc::clone(ctx), name)),
                EnqueueOptions::new(),
            );
            let on_done = completion(ctx, name, &cancel, Some(Phase::Running));
            ctx.queues.enqueue(
                &cancel,
                name,
                Arc::new(StartupTask::new(Arc::clone(ctx), name)),
                EnqueueOptions::new().on_done(on_done),
            );
        }
        Some(Phase::Running) => {
            let cancel = ctx.lifecycle.token(name).unwrap_or_default();
            tracing::info!(package = %name, "rerun package");
            let on_done = completion(ctx, name, &cancel, None);
            let task: Arc<dyn Task> = Arc::new(RunTask::new(Arc::clone(ctx), name));
            ctx.queues
                .enqueue(&cancel, name, task, EnqueueOptions::new().unique().on_done(on_done));
        }
        phase => {
            tracing::debug!(package = %name, ?phase, "package is not loaded, skip schedule");
        }
    }
}

/// Completes the node unless the run was cancelled by a newer event
fn completion(
    ctx: &Arc<TaskContext>,
    name: &str,
    cancel: &CancellationToken,
    phase: Option<Phase>,
) -> impl FnOnce() + Send + 'static {
    let weak: Weak<TaskContext> = Arc::downgrade(ctx);
    let cancel = cancel.clone();
    let name = name.to_string();
    move || {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(ctx) = weak.upgrade() {
            if let Some(phase) = phase {
                ctx.lifecycle.set_phase(&name, phase);
            }
            ctx.scheduler.complete(&name);
        }
    }
}

fn on_disable(ctx: &Arc<TaskContext>, name: &str) {
    if !matches!(
        ctx.lifecycle.phase(name),
        Some(Phase::Loaded) | Some(Phase::Running)
    ) {
        return;
    }

    let cancel = ctx.lifecycle.renew(name, LifecycleEvent::Disable);
    tracing::info!(package = %name, "disable package");
    let weak = Arc::downgrade(ctx);
    let package = name.to_string();
    ctx.queues.enqueue(
        &cancel,
        name,
        Arc::new(DisableTask::new(Arc::clone(ctx), name, true)),
        EnqueueOptions::new().on_done(move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.lifecycle.set_phase(&package, Phase::Loaded);
            }
        }),
    );
}

fn on_values_changed(ctx: &Arc<TaskContext>, name: &str) {
    if ctx.lifecycle.phase(name) != Some(Phase::Running) {
        return;
    }
    let cancel = ctx.lifecycle.token(name).unwrap_or_default();
    tracing::debug!(package = %name, "values changed, run package");
    ctx.queues.enqueue(
        &cancel,
        name,
        Arc::new(RunTask::new(Arc::clone(ctx), name)),
        EnqueueOptions::new().unique(),
    );
}
