//! A loaded package
//!
//! An [`Application`] owns the hooks and the values of one package and knows
//! how to run them. It does not talk to Helm: the package manager drives the
//! release around the hook phases.

use packwarden_core::{Definition, Values, ValuesStorage};
use packwarden_kube::{
    BindingContext, BindingExecutionInfo, BindingType, Hook, HookController, HookExecutor,
    HookIndex, HookInput, KubeEventsManager, MAIN_QUEUE, ObjectPatcher, PackageMeta,
    ReleaseRequest, ScheduleManager,
};
use parking_lot::RwLock;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::scheduler::{Constraints, Package};

const CHART_FILE: &str = "Chart.yaml";
const TEMPLATES_DIR: &str = "templates";

/// Everything the loader collected for a package
pub struct ApplicationParts {
    pub definition: Definition,
    pub path: PathBuf,
    pub namespace: String,
    pub digests: BTreeMap<String, String>,
    pub values: ValuesStorage,
    pub hooks: Vec<Hook>,
}

/// One running package
pub struct Application {
    name: String,
    path: PathBuf,
    namespace: String,
    definition: Definition,
    digests: BTreeMap<String, String>,
    hooks: HookIndex,
    values: ValuesStorage,
    controllers: RwLock<HashMap<String, Arc<HookController>>>,
    hooks_initialized: AtomicBool,
    /// Set once the onStartup hooks ran
    started: AtomicBool,
    executor: Arc<dyn HookExecutor>,
    patcher: Arc<dyn ObjectPatcher>,
}

impl Application {
    pub fn new(
        parts: ApplicationParts,
        executor: Arc<dyn HookExecutor>,
        patcher: Arc<dyn ObjectPatcher>,
    ) -> Self {
        let hooks = HookIndex::new();
        for hook in parts.hooks {
            hooks.add(hook);
        }

        Self {
            name: parts.definition.name.clone(),
            path: parts.path,
            namespace: parts.namespace,
            definition: parts.definition,
            digests: parts.digests,
            hooks,
            values: parts.values,
            controllers: RwLock::new(HashMap::new()),
            hooks_initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            executor,
            patcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn version(&self) -> Option<&str> {
        self.definition.version.as_deref()
    }

    pub fn values(&self) -> &ValuesStorage {
        &self.values
    }

    pub fn hooks(&self) -> Vec<Arc<Hook>> {
        self.hooks.hooks()
    }

    pub fn hooks_by_binding(&self, binding: BindingType) -> Vec<Arc<Hook>> {
        self.hooks.get_hooks_by_binding(binding)
    }

    pub fn hook(&self, name: &str) -> Option<Arc<Hook>> {
        self.hooks.get_hook_by_name(name)
    }

    pub fn values_checksum(&self) -> String {
        self.values.get_values_checksum()
    }

    pub fn settings_checksum(&self) -> String {
        self.values.get_config_checksum()
    }

    pub fn apply_settings(&self, settings: Values) -> Result<()> {
        Ok(self.values.apply_config_values(settings)?)
    }

    /// A chart needs `Chart.yaml` or a `templates/` directory
    pub fn is_helm_chart(&self) -> bool {
        self.path.join(CHART_FILE).exists() || self.path.join(TEMPLATES_DIR).is_dir()
    }

    pub fn hooks_initialized(&self) -> bool {
        self.hooks_initialized.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Create a controller for every hook with event bindings
    pub fn initialize_hooks(
        &self,
        events: &Arc<dyn KubeEventsManager>,
        schedules: &Arc<ScheduleManager>,
    ) {
        let mut controllers = self.controllers.write();
        controllers.clear();
        for hook in self.hooks.hooks() {
            let controller = HookController::new(&hook, Arc::clone(events), Arc::clone(schedules));
            controllers.insert(hook.name.clone(), Arc::new(controller));
        }
        self.hooks_initialized.store(true, Ordering::SeqCst);
        tracing::debug!(package = %self.name, hooks = controllers.len(), "hooks initialized");
    }

    pub fn controller(&self, hook: &str) -> Option<Arc<HookController>> {
        self.controllers.read().get(hook).cloned()
    }

    fn controllers(&self) -> Vec<Arc<HookController>> {
        self.controllers.read().values().cloned().collect()
    }

    /// Start Kubernetes monitors and collect the synchronization runs, by hook
    pub async fn enable_kubernetes_hooks(&self) -> Result<BTreeMap<String, Vec<BindingExecutionInfo>>> {
        let mut runs = BTreeMap::new();
        for hook in self.hooks.get_hooks_by_binding(BindingType::OnKubernetesEvent) {
            let Some(controller) = self.controller(&hook.name) else {
                continue;
            };
            let infos = controller.enable_kubernetes_bindings().await?;
            if !infos.is_empty() {
                runs.insert(hook.name.clone(), infos);
            }
        }
        Ok(runs)
    }

    pub fn enable_schedule_hooks(&self) -> Result<()> {
        for hook in self.hooks.get_hooks_by_binding(BindingType::Schedule) {
            if let Some(controller) = self.controller(&hook.name) {
                controller.enable_schedule_bindings()?;
            }
        }
        Ok(())
    }

    /// Stop monitors and schedules and forget the controllers
    pub fn disable_hooks(&self) {
        let controllers: Vec<_> = self.controllers.write().drain().map(|(_, c)| c).collect();
        for controller in controllers {
            controller.disable_schedule_bindings();
            controller.stop_monitors();
        }
        self.hooks_initialized.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        tracing::debug!(package = %self.name, "hooks disabled");
    }

    /// Unknown hooks and monitors are ignored
    pub fn unlock_kubernetes_monitors(&self, hook: &str, monitor_ids: &[String]) {
        if let Some(controller) = self.controller(hook) {
            for id in monitor_ids {
                controller.unlock_kubernetes_events_for(id);
            }
        }
    }

    /// Run the hooks of a lifecycle binding in order, stopping at the first
    /// failure.
    ///
    /// Helm phases see the current snapshots of all Kubernetes bindings.
    /// `onStartup` hooks run once per enable.
    pub async fn run_hooks_by_binding(
        &self,
        binding: BindingType,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if binding == BindingType::OnStartup && self.is_started() {
            tracing::debug!(package = %self.name, "startup hooks already ran");
            return Ok(());
        }

        for hook in self.hooks.get_hooks_by_binding(binding) {
            let mut context = BindingContext::for_binding(binding);
            if binding.is_helm_phase() {
                if let Some(controller) = self.controller(&hook.name) {
                    context.snapshots = controller.kubernetes_snapshots();
                }
            }
            self.run_hook(&hook, vec![context], cancel).await?;
        }

        if binding == BindingType::OnStartup {
            self.started.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Run one hook with the given contexts; unknown hooks are skipped
    pub async fn run_hook_by_name(
        &self,
        name: &str,
        contexts: Vec<BindingContext>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(hook) = self.hooks.get_hook_by_name(name) else {
            tracing::debug!(package = %self.name, hook = %name, "hook not registered, skip");
            return Ok(());
        };

        let contexts = match self.controller(name) {
            Some(controller) => controller.update_snapshots(contexts),
            None => contexts,
        };
        self.run_hook(&hook, contexts, cancel).await
    }

    async fn run_hook(
        &self,
        hook: &Hook,
        contexts: Vec<BindingContext>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(
            package = %self.name,
            hook = %hook.name,
            binding = %contexts.first().map(|c| c.binding.as_str()).unwrap_or(""),
            "run hook"
        );

        let input = HookInput {
            hook_name: hook.name.clone(),
            path: hook.path.clone(),
            binding_contexts: contexts,
            config_values: self.values.get_config_values().into_inner(),
            config_version: self.values.config_version(),
            values: self.values.get_values().into_inner(),
            env: BTreeMap::new(),
        };
        let output = self.executor.execute(input, cancel).await?;
        let result = output.result;

        if let Some(failure) = output.failure {
            // Status updates of a failed hook still go out
            let mut message = failure;
            if !result.object_patches.is_empty() {
                if let Err(e) = self.patcher.execute_operations(&result.object_patches).await {
                    message = format!("{}; applying object patches: {}", message, e);
                }
            }
            return Err(RuntimeError::HookFailed {
                hook: hook.name.clone(),
                message,
            });
        }

        if !result.object_patches.is_empty() {
            self.patcher
                .execute_operations(&result.object_patches)
                .await?;
        }

        if !result.config_values_patch.is_empty() {
            let current = self.values.get_config_values();
            let patched = result
                .config_values_patch
                .apply(current.inner(), packwarden_core::PatchMode::Strict)?;
            self.values.apply_config_values(Values(patched))?;
        }

        if !result.values_patch.is_empty() {
            self.values.apply_patch(&result.values_patch)?;
        }

        Ok(())
    }

    /// Queues used by the event bindings; `main` is the package queue
    pub fn queues(&self) -> Vec<String> {
        let mut queues = BTreeSet::new();
        for hook in self.hooks.hooks() {
            for queue in hook.config.queues() {
                queues.insert(self.queue_name(&queue));
            }
        }
        queues.into_iter().collect()
    }

    /// Queue for a binding queue name
    pub fn queue_name(&self, queue: &str) -> String {
        if queue.is_empty() || queue == MAIN_QUEUE {
            self.name.clone()
        } else {
            queue.to_string()
        }
    }

    pub fn constraints(&self) -> Constraints {
        let requirements = &self.definition.requirements;
        Constraints {
            order: self.definition.weight,
            kubernetes: requirements.kubernetes.clone(),
            platform: requirements.deckhouse.clone(),
            dependencies: requirements.modules.clone(),
        }
    }

    /// Render or install request with the current values
    pub fn release_request(&self, global: &Values) -> ReleaseRequest {
        let values = self.values.get_values();
        ReleaseRequest {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            chart_dir: self.path.clone(),
            package: PackageMeta {
                name: self.name.clone(),
                version: self.version().unwrap_or_default().to_string(),
                digests: self.digests.clone(),
                registry: values.get("registry").cloned().unwrap_or_default(),
            },
            values: values.into_inner(),
            global: global.inner().clone(),
        }
    }
}

impl Package for Application {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Option<Version> {
        self.definition.parsed_version()
    }

    fn constraints(&self) -> Constraints {
        Application::constraints(self)
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("namespace", &self.namespace)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packwarden_core::{PatchOperation, ValuesPatch};
    use packwarden_kube::{
        HookConfig, HookOutput, HookResult, MockHookExecutor, MockKubeEventsManager,
        ObjectPatchOperation, RecordingPatcher,
    };
    use serde_json::json;

    struct Fixture {
        app: Application,
        executor: Arc<MockHookExecutor>,
        patcher: Arc<RecordingPatcher>,
    }

    fn hook(name: &str, config: &str) -> Hook {
        Hook::new(
            name,
            format!("/packages/{}", name),
            HookConfig::parse(name, config).unwrap(),
        )
    }

    fn fixture(hooks: Vec<Hook>) -> Fixture {
        let executor = Arc::new(MockHookExecutor::new());
        let patcher = Arc::new(RecordingPatcher::new());
        let values = ValuesStorage::with_schemas(
            "echo",
            Values(json!({"foo": 0, "replicas": 1})),
            None,
            None,
        );
        let app = Application::new(
            ApplicationParts {
                definition: Definition::with_name("echo"),
                path: PathBuf::from("/packages/echo"),
                namespace: "d8-echo".to_string(),
                digests: BTreeMap::new(),
                values,
                hooks,
            },
            executor.clone(),
            patcher.clone(),
        );
        Fixture {
            app,
            executor,
            patcher,
        }
    }

    fn values_patch(path: &str, value: serde_json::Value) -> HookOutput {
        HookOutput::success(HookResult {
            values_patch: ValuesPatch::new(vec![PatchOperation::replace(path, value)]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let f = fixture(vec![
            hook("echo/hooks/b", "configVersion: v1\nbeforeHelm: 20"),
            hook("echo/hooks/a", "configVersion: v1\nbeforeHelm: 10"),
            hook("echo/hooks/c", "configVersion: v1\nafterHelm: 5"),
        ]);

        f.app
            .run_hooks_by_binding(BindingType::BeforeHelm, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.executor.called_hooks(), vec!["echo/hooks/a", "echo/hooks/b"]);
    }

    #[tokio::test]
    async fn test_failure_stops_the_binding() {
        let f = fixture(vec![
            hook("echo/hooks/a", "configVersion: v1\nbeforeHelm: 10"),
            hook("echo/hooks/b", "configVersion: v1\nbeforeHelm: 20"),
        ]);
        f.executor.set_failing("echo/hooks/a", Some("exit status 1"));

        let err = f
            .app
            .run_hooks_by_binding(BindingType::BeforeHelm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::HookFailed { .. }));
        assert_eq!(f.executor.called_hooks(), vec!["echo/hooks/a"]);
    }

    #[tokio::test]
    async fn test_values_patch_applied() {
        let f = fixture(vec![hook("echo/hooks/a", "configVersion: v1\nbeforeHelm: 10")]);
        f.executor.push_output("echo/hooks/a", values_patch("/foo", json!(1)));

        let before = f.app.values_checksum();
        f.app
            .run_hooks_by_binding(BindingType::BeforeHelm, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.app.values().get_values().get("foo"), Some(&json!(1)));
        assert_ne!(f.app.values_checksum(), before);
    }

    #[tokio::test]
    async fn test_hook_sees_config_version() {
        let f = fixture(vec![hook("echo/hooks/a", "configVersion: v1\nbeforeHelm: 10")]);
        let cancel = CancellationToken::new();

        f.app
            .run_hooks_by_binding(BindingType::BeforeHelm, &cancel)
            .await
            .unwrap();
        f.app.values().apply_config_values(Values::new()).unwrap();
        f.app
            .run_hooks_by_binding(BindingType::BeforeHelm, &cancel)
            .await
            .unwrap();

        let versions: Vec<u64> = f.executor.calls().iter().map(|c| c.config_version).collect();
        assert_eq!(versions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_failed_hook_still_patches_objects() {
        let f = fixture(vec![hook("echo/hooks/a", "configVersion: v1\nafterHelm: 10")]);
        let operation = ObjectPatchOperation::Create {
            object: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "status"}}),
        };
        f.executor.push_output(
            "echo/hooks/a",
            HookOutput {
                result: HookResult {
                    object_patches: vec![operation.clone()],
                    values_patch: ValuesPatch::new(vec![PatchOperation::replace("/foo", json!(5))]),
                    ..Default::default()
                },
                failure: Some("exit status 2".to_string()),
            },
        );

        let result = f
            .app
            .run_hooks_by_binding(BindingType::AfterHelm, &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(f.patcher.operations(), vec![operation]);
        assert_eq!(f.app.values().get_values().get("foo"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_startup_hooks_run_once() {
        let f = fixture(vec![hook("echo/hooks/init", "configVersion: v1\nonStartup: 1")]);
        let cancel = CancellationToken::new();

        f.app.run_hooks_by_binding(BindingType::OnStartup, &cancel).await.unwrap();
        f.app.run_hooks_by_binding(BindingType::OnStartup, &cancel).await.unwrap();
        assert_eq!(f.executor.call_count("echo/hooks/init"), 1);

        f.app.disable_hooks();
        f.app.run_hooks_by_binding(BindingType::OnStartup, &cancel).await.unwrap();
        assert_eq!(f.executor.call_count("echo/hooks/init"), 2);
    }

    #[tokio::test]
    async fn test_unknown_hook_is_noop() {
        let f = fixture(Vec::new());
        f.app
            .run_hook_by_name("echo/hooks/missing", Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.executor.calls().is_empty());
        f.app.unlock_kubernetes_monitors("echo/hooks/missing", &["x".to_string()]);
    }

    #[tokio::test]
    async fn test_kubernetes_hooks_sync() {
        let f = fixture(vec![hook(
            "echo/hooks/pods",
            r#"
configVersion: v1
kubernetes:
- name: pods
  apiVersion: v1
  kind: Pod
  queue: main
"#,
        )]);
        let events: Arc<dyn KubeEventsManager> = Arc::new(
            MockKubeEventsManager::new()
                .with_object(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}})),
        );
        let schedules = Arc::new(ScheduleManager::new());

        f.app.initialize_hooks(&events, &schedules);
        assert!(f.app.hooks_initialized());

        let runs = f.app.enable_kubernetes_hooks().await.unwrap();
        let infos = &runs["echo/hooks/pods"];
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_synchronization);
        assert_eq!(f.app.queues(), vec!["echo"]);
    }

    #[test]
    fn test_constraints_from_definition() {
        let f = fixture(Vec::new());
        let constraints = f.app.constraints();
        assert_eq!(constraints.order, 900);
        assert!(constraints.dependencies.is_empty());
        assert!(!f.app.is_helm_chart());

        let request = f.app.release_request(&Values(json!({"clusterIsBootstrapped": true})));
        assert_eq!(request.namespace, "d8-echo");
        assert_eq!(request.values["replicas"], json!(1));
        assert_eq!(request.global["clusterIsBootstrapped"], json!(true));
    }
}
