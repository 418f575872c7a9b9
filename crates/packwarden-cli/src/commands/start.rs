//! `packwarden start` - run the operator and the module controllers

use clap::{ArgAction, Args};
use packwarden_controller::{
    Controllers, ModuleLinks, ModuleStatusSink, PullOverrideController, ReleaseController,
    Restarter, SignalRestarter, SourceController, Stores,
};
use packwarden_kube::{
    CommandHelmClient, HelmService, KubeObjectPatcher, KubeWatcherEventsManager, ResourceResolver,
    ScheduleManager, ShellHookExecutor,
};
use packwarden_repo::{OciRegistryClient, RegistryClient};
use packwarden_runtime::{GlobalValues, ManagerServices, Operator, OperatorConfig, PackageUpdate};
use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Directory module images are downloaded into
    #[arg(long, env = "PACKWARDEN_DOWNLOADED_DIR", default_value = "/deckhouse/downloaded")]
    pub downloaded_dir: PathBuf,

    /// Directory of `<weight>-<module>` symlinks [default: <downloaded-dir>/modules]
    #[arg(long, env = "PACKWARDEN_MODULES_DIR")]
    pub modules_dir: Option<PathBuf>,

    /// Namespace the operator runs in
    #[arg(long, env = "PACKWARDEN_NAMESPACE", default_value = "d8-system")]
    pub namespace: String,

    /// Platform version exposed to version constraints
    #[arg(long, env = "PACKWARDEN_PLATFORM_VERSION")]
    pub platform_version: Option<String>,

    /// Whether the cluster finished bootstrapping
    #[arg(long, env = "PACKWARDEN_BOOTSTRAPPED", default_value_t = true, action = ArgAction::Set)]
    pub bootstrapped: bool,

    /// Use this Kubernetes version instead of asking the API server
    #[arg(long, env = "PACKWARDEN_KUBE_VERSION_OVERRIDE")]
    pub kube_version_override: Option<String>,

    /// Helm binary
    #[arg(long, env = "PACKWARDEN_HELM_BINARY", default_value = "helm")]
    pub helm_binary: PathBuf,

    /// Scratch directory for hook and Helm files [default: system temp dir]
    #[arg(long, env = "PACKWARDEN_HOOK_TMP_DIR")]
    pub hook_tmp_dir: Option<PathBuf>,

    /// Interval of the Helm resource checks
    #[arg(long, env = "PACKWARDEN_MONITOR_INTERVAL", default_value = "3m", value_parser = humantime::parse_duration)]
    pub monitor_interval: Duration,

    /// Run the release, source and pull override controllers
    #[arg(long, env = "PACKWARDEN_CONTROLLERS", default_value_t = true, action = ArgAction::Set)]
    pub controllers: bool,

    /// Process receiving restart signals
    #[arg(long, env = "PACKWARDEN_RESTART_PID", default_value_t = 1)]
    pub restart_pid: i32,
}

impl StartArgs {
    pub fn modules_dir(&self) -> PathBuf {
        self.modules_dir
            .clone()
            .unwrap_or_else(|| self.downloaded_dir.join("modules"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.hook_tmp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("packwarden"))
    }

    /// Reject settings that would only fail later
    pub fn validate(&self) -> Result<()> {
        for (flag, version) in [
            ("--platform-version", &self.platform_version),
            ("--kube-version-override", &self.kube_version_override),
        ] {
            if let Some(version) = version {
                packwarden_core::parse_version(version).map_err(|e| CliError::Config {
                    message: format!("{} '{}': {}", flag, version, e),
                    help: Some("use a semantic version such as 1.30.2".to_string()),
                })?;
            }
        }
        if self.monitor_interval.is_zero() {
            return Err(CliError::config("--monitor-interval must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Stop,
    Restart,
}

pub async fn run(args: StartArgs, debug_socket: PathBuf) -> Result<()> {
    args.validate()?;
    let tmp = args.tmp_dir();
    std::fs::create_dir_all(&tmp)?;

    let client = kube::Client::try_default().await?;
    let kube_version = match &args.kube_version_override {
        Some(version) => version.clone(),
        None => {
            let info = client.apiserver_version().await?;
            info.git_version.trim_start_matches('v').to_string()
        }
    };

    let global = Arc::new(GlobalValues::default());
    global.set_kubernetes_version(&kube_version);
    if let Some(version) = &args.platform_version {
        global.set_platform_version(version);
    }
    global.set_bootstrapped(args.bootstrapped);
    global.set("discovery.namespace", serde_json::Value::String(args.namespace.clone()));

    let resolver = Arc::new(ResourceResolver::new(client.clone()).await?);
    let services = ManagerServices {
        helm: Arc::new(HelmService::new(
            Arc::new(CommandHelmClient::new(&args.helm_binary)),
            resolver.clone(),
            tmp.join("helm"),
            args.monitor_interval,
        )),
        executor: Arc::new(ShellHookExecutor::new(tmp.join("hooks"))),
        patcher: Arc::new(KubeObjectPatcher::new(resolver.clone())),
        events: Arc::new(KubeWatcherEventsManager::new(client.clone(), resolver)),
        schedules: Arc::new(ScheduleManager::new()),
        global,
    };

    let operator = Arc::new(Operator::new(
        services,
        OperatorConfig {
            debug_socket: Some(debug_socket),
        },
    ));
    operator.start()?;
    tracing::info!(
        kubernetes = %kube_version,
        namespace = %args.namespace,
        controllers = args.controllers,
        "operator running"
    );

    let links = ModuleLinks::new(args.downloaded_dir.clone(), args.modules_dir());
    let cancel = CancellationToken::new();
    let controllers = if args.controllers {
        let stores = Stores::kube(client.clone());
        operator.add_status_sink(Arc::new(ModuleStatusSink::new(stores.modules.clone())));

        let registry: Arc<dyn RegistryClient> = Arc::new(OciRegistryClient::new());
        let restarter: Arc<dyn Restarter> = Arc::new(SignalRestarter::with_pid(args.restart_pid));
        let controllers = Controllers {
            releases: Arc::new(ReleaseController::new(
                stores.clone(),
                registry.clone(),
                links.clone(),
                restarter.clone(),
            )),
            sources: Arc::new(SourceController::new(
                stores.clone(),
                registry.clone(),
                args.downloaded_dir.clone(),
            )),
            overrides: Arc::new(PullOverrideController::new(
                stores,
                registry,
                links.clone(),
                restarter,
            )),
        };
        Some(controllers.spawn(client, &cancel))
    } else {
        None
    };

    load_linked_modules(&operator, &links)?;

    let shutdown = wait_for_signal().await?;
    tracing::info!(shutdown = ?shutdown, "shutting down");

    cancel.cancel();
    if let Some(mut set) = controllers {
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "controller task failed");
            }
        }
    }
    operator.stop().await;

    if shutdown == Shutdown::Restart {
        reexec()?;
    }
    Ok(())
}

/// Register every linked module with the operator
fn load_linked_modules(operator: &Operator, links: &ModuleLinks) -> Result<usize> {
    let linked = links.discover()?;
    for module in &linked {
        tracing::info!(
            module = %module.name,
            weight = module.weight,
            version = %module.version,
            "found module"
        );
        operator.update(PackageUpdate {
            name: module.name.clone(),
            path: module.path.clone(),
            version: module.version.trim_start_matches('v').to_string(),
            ..Default::default()
        });
    }
    Ok(linked.len())
}

async fn wait_for_signal() -> Result<Shutdown> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut restart = signal(SignalKind::user_defined2())?;

    Ok(tokio::select! {
        _ = terminate.recv() => Shutdown::Stop,
        _ = interrupt.recv() => Shutdown::Stop,
        _ = restart.recv() => Shutdown::Restart,
    })
}

/// Replace the process image with a fresh copy of this binary
fn reexec() -> Result<()> {
    let exe = CString::new("/proc/self/exe")
        .map_err(|e| CliError::operator(format!("re-exec failed: {}", e)))?;
    let args = exec_args(std::env::args_os())?;

    tracing::info!(args = ?args, "re-executing");
    match nix::unistd::execv(&exe, &args) {
        Ok(never) => match never {},
        Err(e) => Err(CliError::operator(format!("re-exec failed: {}", e))),
    }
}

fn exec_args(args: impl Iterator<Item = std::ffi::OsString>) -> Result<Vec<CString>> {
    args.map(|arg| {
        CString::new(arg.into_vec())
            .map_err(|e| CliError::operator(format!("invalid argument for re-exec: {}", e)))
    })
    .collect()
}
