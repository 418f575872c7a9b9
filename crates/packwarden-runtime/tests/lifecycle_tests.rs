//! End-to-end lifecycle tests over in-memory Kubernetes and Helm

use async_trait::async_trait;
use packwarden_core::{Constraint, Dependency, PatchOperation, ValuesPatch};
use packwarden_kube::{
    HelmService, HookOutput, HookResult, MockHelmClient, MockHookExecutor, MockKubeEventsManager,
    MockResourceChecker, RecordingPatcher, ScheduleManager,
};
use packwarden_runtime::scheduler::VersionGetter;
use packwarden_runtime::{
    ConditionType, EnqueueOptions, GlobalValues, ManagerServices, Operator, OperatorConfig,
    PackageSpec, PackageUpdate, Phase, QueueService, Result, Scheduler, SchedulerConfig, Task,
};
use parking_lot::{Mutex, RwLock};
use semver::Version;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn write_hook(path: &Path) -> PathBuf {
    write(path, "#!/bin/sh\n");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

fn patch_foo(value: i64) -> HookOutput {
    HookOutput::success(HookResult {
        values_patch: ValuesPatch::new(vec![PatchOperation::replace("/foo", json!(value))]),
        ..Default::default()
    })
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Cluster {
    tmp: TempDir,
    operator: Arc<Operator>,
    helm: Arc<MockHelmClient>,
    executor: Arc<MockHookExecutor>,
}

/// Package `echo` (order 500) with a deployment chart, an onStartup hook
/// and a beforeHelm hook
fn cluster() -> Cluster {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("echo");
    write(&dir.join("package.yaml"), "name: echo\nversion: 1.0.0\nweight: 500\n");
    write(&dir.join("values.yaml"), "foo: 0\n");
    write(&dir.join("Chart.yaml"), "name: echo\nversion: 1.0.0\n");
    write(
        &dir.join("templates/deployment.yaml"),
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: echo\n  namespace: d8-echo\n",
    );

    let executor = Arc::new(
        MockHookExecutor::new()
            .with_config(write_hook(&dir.join("hooks/startup")), "configVersion: v1\nonStartup: 1")
            .with_config(write_hook(&dir.join("hooks/values")), "configVersion: v1\nbeforeHelm: 10"),
    );
    let helm = Arc::new(MockHelmClient::new());

    let global = Arc::new(GlobalValues::default());
    global.set_bootstrapped(true);

    let services = ManagerServices {
        helm: Arc::new(HelmService::new(
            helm.clone(),
            Arc::new(MockResourceChecker::new()),
            tmp.path().join("tmp"),
            Duration::from_secs(60),
        )),
        executor: executor.clone(),
        patcher: Arc::new(RecordingPatcher::new()),
        events: Arc::new(MockKubeEventsManager::new()),
        schedules: Arc::new(ScheduleManager::new()),
        global,
    };
    let operator = Arc::new(Operator::new(services, OperatorConfig::default()));
    operator.start().unwrap();

    Cluster {
        tmp,
        operator,
        helm,
        executor,
    }
}

impl Cluster {
    fn update(&self) {
        self.operator.update(PackageUpdate {
            name: "echo".to_string(),
            path: self.tmp.path().join("echo"),
            version: "1.0.0".to_string(),
            ..Default::default()
        });
    }

    async fn wait_running(&self) {
        let lifecycle = self.operator.lifecycle().clone();
        eventually("echo to run", || lifecycle.phase("echo") == Some(Phase::Running)).await;
    }
}

#[tokio::test]
async fn test_happy_path_load_and_run() {
    let cluster = cluster();
    cluster.executor.push_output("echo/hooks/values", patch_foo(1));

    cluster.update();
    cluster.wait_running().await;

    let release = cluster.helm.release("echo").unwrap();
    assert_eq!(release.revision, 1);
    assert_eq!(release.values["foo"], json!(1));
    assert_eq!(release.values["Package"]["Name"], json!("echo"));

    let ready = cluster
        .operator
        .status()
        .condition("echo", ConditionType::ReadyInRuntime)
        .unwrap();
    assert!(ready.is_true());
    assert_eq!(
        cluster.executor.called_hooks(),
        vec!["echo/hooks/startup", "echo/hooks/values"]
    );

    let dump = cluster.operator.packages_dump().unwrap();
    assert!(dump.contains("phase: Running"));
    assert!(dump.contains("node: active"));

    cluster.operator.stop().await;
}

#[tokio::test]
async fn test_values_change_triggers_run() {
    let cluster = cluster();
    cluster.update();
    cluster.wait_running().await;
    assert_eq!(cluster.helm.upgrade_count(), 1);

    cluster.executor.push_output("echo/hooks/values", patch_foo(2));
    cluster
        .operator
        .manager()
        .run_package_hook("echo", "echo/hooks/values", Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    let helm = cluster.helm.clone();
    eventually("second upgrade", || helm.upgrade_count() == 2).await;
    let release = cluster.helm.release("echo").unwrap();
    assert_eq!(release.revision, 2);
    assert_eq!(release.values["foo"], json!(2));

    cluster.operator.stop().await;
}

#[tokio::test]
async fn test_settings_update_of_running_package() {
    let cluster = cluster();
    write(
        &cluster.tmp.path().join("echo/openapi/config-values.yaml"),
        "type: object\nproperties:\n  replicas:\n    type: integer\n",
    );
    cluster.update();
    cluster.wait_running().await;

    cluster.operator.update(PackageUpdate {
        name: "echo".to_string(),
        path: cluster.tmp.path().join("echo"),
        version: "1.0.0".to_string(),
        settings: Some(packwarden_core::Values(json!({"replicas": 3}))),
        ..Default::default()
    });

    let operator = cluster.operator.clone();
    eventually("settings applied", || {
        operator
            .manager()
            .get("echo")
            .and_then(|app| app.values().get_config_values().get("replicas").cloned())
            == Some(json!(3))
    })
    .await;

    cluster.operator.stop().await;
}

#[tokio::test]
async fn test_remove_uninstalls_and_forgets() {
    let cluster = cluster();
    cluster.update();
    cluster.wait_running().await;

    cluster.operator.remove("echo");
    let operator = cluster.operator.clone();
    eventually("package removal", || !operator.scheduler().contains("echo")).await;

    assert!(cluster.operator.manager().get("echo").is_none());
    assert_eq!(cluster.helm.uninstall_count(), 1);
    assert!(!cluster.operator.lifecycle().contains("echo"));
    assert!(!cluster.operator.queues().exists("echo"));

    cluster.operator.stop().await;
}

fn dependency(constraint: &str) -> Dependency {
    Dependency {
        constraint: Constraint::parse(constraint).unwrap(),
        optional: false,
    }
}

#[test]
fn test_scheduler_cascade() {
    let kube_version = Arc::new(RwLock::new(Version::new(1, 30, 0)));
    let getter: VersionGetter = {
        let version = kube_version.clone();
        Arc::new(move || Ok(version.read().clone()))
    };
    let scheduler = Scheduler::new(
        SchedulerConfig::new()
            .kubernetes_version(getter)
            .bootstrap(Arc::new(|| true)),
    );

    let scheduled = Arc::new(Mutex::new(Vec::new()));
    let disabled = Arc::new(Mutex::new(Vec::new()));
    {
        let scheduled = scheduled.clone();
        scheduler.on_schedule(move |name| scheduled.lock().push(name.to_string()));
        let disabled = disabled.clone();
        scheduler.on_disable(move |name| disabled.lock().push(name.to_string()));
    }

    let a = PackageSpec::new("a", 100)
        .with_version(Version::new(1, 0, 0))
        .with_kubernetes(Constraint::parse(">=1.28").unwrap());
    let b = PackageSpec::new("b", 500)
        .with_version(Version::new(1, 0, 0))
        .with_dependency("a", dependency(">=1.0"));
    let c = PackageSpec::new("c", 500).with_version(Version::new(1, 0, 0));
    scheduler.initialize(&[&a, &b, &c]);
    assert_eq!(*scheduled.lock(), vec!["a"]);

    scheduler.complete("a");
    assert_eq!(*scheduled.lock(), vec!["a", "b", "c"]);

    *kube_version.write() = Version::new(1, 20, 0);
    scheduler.schedule();
    assert_eq!(*disabled.lock(), vec!["a", "b"]);
    assert!(scheduler.is_enabled("c"));
    assert_eq!(
        scheduler.status("a").unwrap().reason,
        "KubernetesVersionMismatch"
    );
    assert_eq!(scheduler.status("b").unwrap().reason, "DependencyNotEnabled");
}

struct Blocker {
    release: Arc<Notify>,
}

#[async_trait]
impl Task for Blocker {
    fn name(&self) -> &str {
        "Blocker"
    }

    async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
        self.release.notified().await;
        Ok(())
    }
}

struct Named(&'static str);

#[async_trait]
impl Task for Named {
    fn name(&self) -> &str {
        self.0
    }

    async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_queue_uniqueness() {
    let queues = QueueService::new();
    let cancel = CancellationToken::new();
    let release = Arc::new(Notify::new());

    queues.enqueue(
        &cancel,
        "q",
        Arc::new(Blocker {
            release: release.clone(),
        }),
        EnqueueOptions::new(),
    );
    eventually("blocker to start", || {
        queues.snapshot()[0].current.as_deref() == Some("Blocker")
    })
    .await;

    queues.enqueue(&cancel, "q", Arc::new(Named("T")), EnqueueOptions::new());
    queues.enqueue(&cancel, "q", Arc::new(Named("T")), EnqueueOptions::new().unique());

    let dump = queues.dump().unwrap();
    assert_eq!(dump.matches("- T").count(), 1);
    assert_eq!(queues.len("q"), 2);

    release.notify_one();
    eventually("queue to drain", || queues.len("q") == 0).await;
    queues.stop().await;
}
