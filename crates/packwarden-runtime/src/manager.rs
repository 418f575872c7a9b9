//! Package manager
//!
//! Owns the loaded [`Application`]s and drives their lifecycle around Helm:
//! load, settings, startup, the run cycle, hook runs and disable. Every
//! failure of a lifecycle step comes back as a [`PackageError`] carrying the
//! conditions to report.

use packwarden_core::Values;
use packwarden_kube::{
    BindingContext, BindingExecutionInfo, BindingType, HelmService, HookExecutor, KubeEvent,
    KubeEventsManager, ObjectPatcher, ScheduleManager,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::app::Application;
use crate::error::{ErrorReason, PackageError, Result, RuntimeError};
use crate::global::GlobalValues;
use crate::loader::PackageLoader;
use crate::queue::Task;

/// Called with the package name when a hook run changed its values
pub type ValuesChangedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Turns `(package, hook, run)` into `(queue, task)`
pub type TaskBuilder = dyn Fn(&str, &str, BindingExecutionInfo) -> (String, Arc<dyn Task>) + Send + Sync;

/// Tasks to enqueue, by queue
pub type QueuedTasks = BTreeMap<String, Vec<Arc<dyn Task>>>;

/// Collaborators of the package manager
#[derive(Clone)]
pub struct ManagerServices {
    pub helm: Arc<HelmService>,
    pub executor: Arc<dyn HookExecutor>,
    pub patcher: Arc<dyn ObjectPatcher>,
    pub events: Arc<dyn KubeEventsManager>,
    pub schedules: Arc<ScheduleManager>,
    pub global: Arc<GlobalValues>,
}

/// Resumes the Helm resource monitor of a package when dropped
struct MonitorPause<'a> {
    helm: &'a HelmService,
    package: &'a str,
}

impl<'a> MonitorPause<'a> {
    fn new(helm: &'a HelmService, package: &'a str) -> Self {
        helm.pause_monitor(package);
        Self { helm, package }
    }
}

impl Drop for MonitorPause<'_> {
    fn drop(&mut self) {
        self.helm.resume_monitor(self.package);
    }
}

/// Serializable view of a loaded package
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDump {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub path: String,
    pub namespace: String,
    pub weight: u32,
    pub hooks: Vec<String>,
    pub hooks_initialized: bool,
    pub values_checksum: String,
    pub config_checksum: String,
    pub config_values: JsonValue,
    pub values: JsonValue,
}

pub struct PackageManager {
    apps: RwLock<HashMap<String, Arc<Application>>>,
    loader: PackageLoader,
    helm: Arc<HelmService>,
    events: Arc<dyn KubeEventsManager>,
    schedules: Arc<ScheduleManager>,
    global: Arc<GlobalValues>,
    on_values_changed: RwLock<Option<ValuesChangedCallback>>,
}

impl PackageManager {
    pub fn new(services: ManagerServices) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            loader: PackageLoader::new(services.executor, services.patcher),
            helm: services.helm,
            events: services.events,
            schedules: services.schedules,
            global: services.global,
            on_values_changed: RwLock::new(None),
        }
    }

    pub fn on_values_changed(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_values_changed.write() = Some(Arc::new(callback));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Application>> {
        self.apps.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn require(&self, name: &str) -> Result<Arc<Application>> {
        self.get(name)
            .ok_or_else(|| RuntimeError::PackageNotFound(name.to_string()))
    }

    /// Applications sorted by name
    fn apps(&self) -> Vec<Arc<Application>> {
        let mut apps: Vec<_> = self.apps.read().values().cloned().collect();
        apps.sort_by(|a, b| a.name().cmp(b.name()));
        apps
    }

    /// Load a package and install it under its name, replacing a previous
    /// instance only on success
    pub async fn load_package(&self, name: &str, path: &Path, namespace: Option<&str>) -> Result<()> {
        let app = self
            .loader
            .load(name, path, namespace)
            .await
            .map_err(|e| PackageError::new(ErrorReason::LoadFailed, e))?;

        tracing::info!(package = %name, version = ?app.version(), "package loaded");
        self.apps.write().insert(name.to_string(), Arc::new(app));
        Ok(())
    }

    /// Replace the settings of a package; unknown packages are ignored
    pub fn apply_settings(&self, name: &str, settings: Values) -> Result<()> {
        let Some(app) = self.get(name) else {
            tracing::debug!(package = %name, "apply settings to unknown package, skip");
            return Ok(());
        };
        app.apply_settings(settings)
            .map_err(|e| PackageError::new(ErrorReason::ApplySettings, e))?;
        Ok(())
    }

    pub fn settings_changed(&self, name: &str, settings: &Values) -> bool {
        if settings.is_empty() {
            return false;
        }
        self.get(name)
            .is_some_and(|app| app.settings_checksum() != settings.checksum())
    }

    pub fn version_changed(&self, name: &str, version: &str) -> bool {
        if version.is_empty() {
            return false;
        }
        self.get(name)
            .is_some_and(|app| app.version() != Some(version))
    }

    /// Create the hook controllers of a package
    pub fn initialize_hooks(&self, name: &str) -> Result<()> {
        let app = self
            .require(name)
            .map_err(|e| PackageError::new(ErrorReason::InitHooksFailed, e))?;
        app.initialize_hooks(&self.events, &self.schedules);
        Ok(())
    }

    /// Start the Kubernetes monitors of a package, returning the initial
    /// synchronization runs by hook
    pub async fn enable_kubernetes_hooks(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<BindingExecutionInfo>>> {
        let app = self
            .require(name)
            .map_err(|e| PackageError::new(ErrorReason::InitHooksFailed, e))?;
        let runs = app
            .enable_kubernetes_hooks()
            .await
            .map_err(|e| PackageError::new(ErrorReason::InitHooksFailed, e))?;
        Ok(runs)
    }

    pub fn enable_schedule_hooks(&self, name: &str) -> Result<()> {
        let app = self
            .require(name)
            .map_err(|e| PackageError::new(ErrorReason::InitHooksFailed, e))?;
        app.enable_schedule_hooks()
            .map_err(|e| PackageError::new(ErrorReason::InitHooksFailed, e))?;
        Ok(())
    }

    /// Run the onStartup hooks, then the run cycle
    pub async fn startup_package(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let app = self.require(name)?;
        app.run_hooks_by_binding(BindingType::OnStartup, cancel)
            .await
            .map_err(|e| PackageError::new(ErrorReason::StartupHookFailed, e))?;
        self.run_package(name, cancel).await
    }

    /// The steady-state cycle: beforeHelm hooks, upgrade, afterHelm hooks,
    /// and a second upgrade when afterHelm hooks changed the values
    pub async fn run_package(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let app = self.require(name)?;
        let _pause = MonitorPause::new(&self.helm, name);

        app.run_hooks_by_binding(BindingType::BeforeHelm, cancel)
            .await
            .map_err(|e| PackageError::new(ErrorReason::BeforeHelmHooksFailed, e))?;

        self.upgrade(&app).await?;

        let checksum = app.values_checksum();
        app.run_hooks_by_binding(BindingType::AfterHelm, cancel)
            .await
            .map_err(|e| PackageError::new(ErrorReason::AfterHelmHooksFailed, e))?;

        if app.values_checksum() != checksum {
            tracing::info!(package = %name, "values changed by afterHelm hooks, upgrade again");
            self.upgrade(&app).await?;
        }
        Ok(())
    }

    async fn upgrade(&self, app: &Application) -> Result<()> {
        let request = app.release_request(&self.global.get());
        match self.helm.upgrade(&request).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_helm() => Ok(()),
            Err(e) => Err(PackageError::helm(e).into()),
        }
    }

    /// Stop a package. Without `keep` the release is uninstalled, the
    /// afterDeleteHelm hooks run and the package is forgotten.
    pub async fn disable_package(&self, name: &str, keep: bool, cancel: &CancellationToken) -> Result<()> {
        let Some(app) = self.get(name) else {
            tracing::debug!(package = %name, "disable unknown package, skip");
            return Ok(());
        };

        self.helm.remove_monitor(name);

        if !keep {
            if app.is_helm_chart() {
                self.helm
                    .delete(name, app.namespace())
                    .await
                    .map_err(PackageError::helm)?;
            }
            app.run_hooks_by_binding(BindingType::AfterDeleteHelm, cancel)
                .await
                .map_err(|e| PackageError::new(ErrorReason::AfterDeleteHelmHooksFailed, e))?;
            self.apps.write().remove(name);
        }

        app.disable_hooks();
        tracing::info!(package = %name, keep, "package disabled");
        Ok(())
    }

    /// Run a single hook, reporting a values change through the callback
    pub async fn run_package_hook(
        &self,
        name: &str,
        hook: &str,
        contexts: Vec<BindingContext>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let app = self.require(name)?;
        let _pause = MonitorPause::new(&self.helm, name);

        let before = app.values_checksum();
        app.run_hook_by_name(hook, contexts, cancel).await?;

        if app.values_checksum() != before {
            let callback = self.on_values_changed.read().clone();
            if let Some(callback) = callback {
                tracing::debug!(package = %name, hook = %hook, "values changed by hook");
                callback(name);
            }
        }
        Ok(())
    }

    /// Tasks for a Kubernetes event, by queue
    pub fn build_kube_tasks(&self, event: &KubeEvent, builder: &TaskBuilder) -> QueuedTasks {
        let mut tasks = QueuedTasks::new();
        for app in self.apps() {
            for hook in app.hooks_by_binding(BindingType::OnKubernetesEvent) {
                let Some(controller) = app.controller(&hook.name) else {
                    continue;
                };
                if let Some(info) = controller.handle_kube_event(event) {
                    let (queue, task) = builder(app.name(), &hook.name, info);
                    tasks.entry(queue).or_default().push(task);
                }
            }
        }
        tasks
    }

    /// Tasks for a fired crontab, by queue
    pub fn build_schedule_tasks(&self, crontab: &str, builder: &TaskBuilder) -> QueuedTasks {
        let mut tasks = QueuedTasks::new();
        for app in self.apps() {
            for hook in app.hooks_by_binding(BindingType::Schedule) {
                let Some(controller) = app.controller(&hook.name) else {
                    continue;
                };
                for info in controller.handle_schedule_event(crontab) {
                    let (queue, task) = builder(app.name(), &hook.name, info);
                    tasks.entry(queue).or_default().push(task);
                }
            }
        }
        tasks
    }

    /// Queues a package may use, its own queue first
    pub fn get_package_queues(&self, name: &str) -> Vec<String> {
        let mut queues = vec![name.to_string()];
        if let Some(app) = self.get(name) {
            for queue in app.queues() {
                if !queues.contains(&queue) {
                    queues.push(queue);
                }
            }
        }
        queues
    }

    /// Manifests of the package rendered with its current values
    pub async fn render(&self, name: &str) -> Result<String> {
        let app = self.require(name)?;
        let request = app.release_request(&self.global.get());
        Ok(self.helm.render(&request).await?)
    }

    pub fn snapshot(&self) -> Vec<PackageDump> {
        self.apps()
            .iter()
            .map(|app| PackageDump {
                name: app.name().to_string(),
                version: app.version().map(str::to_string),
                path: app.path().display().to_string(),
                namespace: app.namespace().to_string(),
                weight: app.definition().weight,
                hooks: app.hooks().iter().map(|h| h.name.clone()).collect(),
                hooks_initialized: app.hooks_initialized(),
                values_checksum: app.values_checksum(),
                config_checksum: app.settings_checksum(),
                config_values: app.values().get_config_values().into_inner(),
                values: app.values().get_values().into_inner(),
            })
            .collect()
    }

    /// YAML snapshot of all packages
    pub fn dump(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.snapshot())?)
    }
}
