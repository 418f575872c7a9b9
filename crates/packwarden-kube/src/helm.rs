//! Helm releases of packages
//!
//! [`HelmService`] renders a package chart, compares the rendered manifests
//! with what was last installed and only upgrades the release when
//! something changed. Installed releases get a [`ResourceMonitor`] that
//! reports objects deleted behind Helm's back.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{HelmStep, KubeError, Result};
use crate::monitor::{AbsentCallback, ResourceMonitor};
use crate::resources::{ResourceChecker, parse_manifests};

const CHART_FILE: &str = "Chart.yaml";
const TEMPLATES_DIR: &str = "templates";

/// Values key holding the manifest checksum of the installed revision
pub const CHECKSUM_VALUES_KEY: &str = "packageChecksum";

/// Status of an installed release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub revision: u64,
    pub status: String,
    pub checksum: Option<String>,
}

impl ReleaseInfo {
    pub fn is_deployed(&self) -> bool {
        self.status.eq_ignore_ascii_case("deployed")
    }
}

/// Helm operations on one release
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn render(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
        values_file: &Path,
    ) -> Result<String>;

    /// Install or upgrade, recording `checksum`
    async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
        values_file: &Path,
        checksum: &str,
    ) -> Result<()>;

    /// `None` when the release does not exist
    async fn status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseInfo>>;

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()>;
}

/// Package metadata passed to templates as `.Values.Package`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    #[serde(default)]
    pub registry: JsonValue,
}

/// A release to render or install
#[derive(Debug, Clone, Default)]
pub struct ReleaseRequest {
    pub name: String,
    pub namespace: String,
    pub chart_dir: PathBuf,
    pub values: JsonValue,
    pub package: PackageMeta,
    /// Passed to templates as `.Values.Global`
    pub global: JsonValue,
}

impl ReleaseRequest {
    fn runtime_values(&self) -> Result<JsonValue> {
        let mut values = match &self.values {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => serde_json::Map::new(),
            other => {
                return Err(KubeError::helm(
                    HelmStep::MarshalRuntimeValues,
                    format!("values must be an object, got {}", other),
                ));
            }
        };

        let package = serde_json::to_value(&self.package)
            .map_err(|e| KubeError::helm(HelmStep::MarshalRuntimeValues, e))?;
        values.insert("Package".to_string(), package);
        values.insert("Global".to_string(), self.global.clone());
        Ok(JsonValue::Object(values))
    }
}

/// Release management with change detection and resource monitoring
pub struct HelmService {
    client: Arc<dyn HelmClient>,
    checker: Arc<dyn ResourceChecker>,
    tmp_dir: PathBuf,
    monitor_interval: Duration,
    monitors: Mutex<HashMap<String, Arc<ResourceMonitor>>>,
    on_absent: RwLock<Option<AbsentCallback>>,
}

impl HelmService {
    pub fn new(
        client: Arc<dyn HelmClient>,
        checker: Arc<dyn ResourceChecker>,
        tmp_dir: impl Into<PathBuf>,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            client,
            checker,
            tmp_dir: tmp_dir.into(),
            monitor_interval,
            monitors: Mutex::new(HashMap::new()),
            on_absent: RwLock::new(None),
        }
    }

    /// Callback for monitors that find absent resources
    pub fn set_absent_callback(&self, callback: AbsentCallback) {
        *self.on_absent.write() = Some(callback);
    }

    /// Render the chart with runtime values
    pub async fn render(&self, request: &ReleaseRequest) -> Result<String> {
        check_chart(&request.chart_dir, &request.name)?;
        let values_file = self.write_values_file(request).await?;

        let result = self
            .client
            .render(&request.namespace, &request.name, &request.chart_dir, &values_file)
            .await
            .map_err(|e| KubeError::helm(HelmStep::Render, e));

        remove_values_file(&values_file).await;
        result
    }

    /// Install or upgrade the release when the rendered manifests, the
    /// release status or the cluster state call for it
    pub async fn upgrade(&self, request: &ReleaseRequest) -> Result<()> {
        check_chart(&request.chart_dir, &request.name)?;
        let values_file = self.write_values_file(request).await?;

        let result = self.upgrade_with(request, &values_file).await;

        remove_values_file(&values_file).await;
        result
    }

    async fn upgrade_with(&self, request: &ReleaseRequest, values_file: &Path) -> Result<()> {
        let manifests = self
            .client
            .render(&request.namespace, &request.name, &request.chart_dir, values_file)
            .await
            .map_err(|e| KubeError::helm(HelmStep::Render, e))?;
        let resources =
            parse_manifests(&manifests).map_err(|e| KubeError::helm(HelmStep::Render, e))?;
        let checksum = hex::encode(Sha256::digest(manifests.as_bytes()));

        let monitor = Arc::new(ResourceMonitor::new(
            &request.name,
            &request.namespace,
            resources,
            Arc::clone(&self.checker),
        ));

        if self.should_upgrade(request, &checksum, &monitor).await? {
            tracing::info!(package = %request.name, checksum = %checksum, "upgrade helm release");
            self.client
                .upgrade(
                    &request.namespace,
                    &request.name,
                    &request.chart_dir,
                    values_file,
                    &checksum,
                )
                .await
                .map_err(|e| KubeError::helm(HelmStep::Install, e))?;
        } else {
            tracing::debug!(package = %request.name, "helm release is up to date");
        }

        self.add_monitor(monitor);
        Ok(())
    }

    async fn should_upgrade(
        &self,
        request: &ReleaseRequest,
        checksum: &str,
        monitor: &ResourceMonitor,
    ) -> Result<bool> {
        let status = self
            .client
            .status(&request.namespace, &request.name)
            .await
            .map_err(|e| KubeError::helm(HelmStep::CheckRelease, e))?;

        let Some(release) = status else {
            return Ok(true);
        };
        if !release.is_deployed() {
            tracing::debug!(package = %request.name, status = %release.status, "release is not deployed");
            return Ok(true);
        }
        if release.checksum.as_deref() != Some(checksum) {
            return Ok(true);
        }

        let absent = monitor
            .absent_resources()
            .await
            .map_err(|e| KubeError::helm(HelmStep::CheckRelease, e))?;
        if !absent.is_empty() {
            tracing::info!(package = %request.name, absent = absent.len(), "release resources are absent");
            return Ok(true);
        }

        Ok(false)
    }

    fn add_monitor(&self, monitor: Arc<ResourceMonitor>) {
        let mut monitors = self.monitors.lock();
        if let Some(previous) = monitors.remove(monitor.package()) {
            if previous.is_paused() {
                monitor.pause();
            }
            previous.stop();
        }

        if let Some(callback) = self.on_absent.read().clone() {
            monitor.start(self.monitor_interval, callback);
        }
        monitors.insert(monitor.package().to_string(), monitor);
    }

    /// Uninstall the release and drop its monitor
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        self.remove_monitor(name);
        tracing::info!(package = %name, "uninstall helm release");
        self.client
            .uninstall(namespace, name)
            .await
            .map_err(|e| KubeError::helm(HelmStep::Uninstall, e))
    }

    pub fn has_monitor(&self, name: &str) -> bool {
        self.monitors.lock().contains_key(name)
    }

    pub fn remove_monitor(&self, name: &str) {
        if let Some(monitor) = self.monitors.lock().remove(name) {
            monitor.stop();
        }
    }

    pub fn pause_monitor(&self, name: &str) {
        if let Some(monitor) = self.monitors.lock().get(name) {
            monitor.pause();
        }
    }

    pub fn resume_monitor(&self, name: &str) {
        if let Some(monitor) = self.monitors.lock().get(name) {
            monitor.resume();
        }
    }

    pub fn is_monitor_paused(&self, name: &str) -> Option<bool> {
        self.monitors.lock().get(name).map(|m| m.is_paused())
    }

    pub fn stop_monitors(&self) {
        for (_, monitor) in self.monitors.lock().drain() {
            monitor.stop();
        }
    }

    async fn write_values_file(&self, request: &ReleaseRequest) -> Result<PathBuf> {
        let values = request.runtime_values()?;
        let yaml = serde_yaml::to_string(&values)
            .map_err(|e| KubeError::helm(HelmStep::MarshalRuntimeValues, e))?;

        let path = self.tmp_dir.join(format!(
            "{}.package-values.yaml-{}",
            request.name,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| KubeError::helm(HelmStep::CreateValuesFile, e))?;
        tokio::fs::write(&path, yaml)
            .await
            .map_err(|e| KubeError::helm(HelmStep::CreateValuesFile, e))?;
        Ok(path)
    }
}

/// `Chart.yaml` or a `templates/` directory makes a package a chart
fn check_chart(chart_dir: &Path, name: &str) -> Result<()> {
    for candidate in [CHART_FILE, TEMPLATES_DIR] {
        match std::fs::metadata(chart_dir.join(candidate)) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KubeError::helm(HelmStep::CheckChart, e)),
        }
    }

    tracing::debug!(package = %name, path = %chart_dir.display(), "no helm chart found");
    Err(KubeError::PackageNotHelm {
        name: name.to_string(),
    })
}

async fn remove_values_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove values file");
    }
}

/// Helm client running the `helm` binary
pub struct CommandHelmClient {
    binary: PathBuf,
}

#[derive(Deserialize)]
struct StatusOutput {
    version: u64,
    info: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    status: String,
}

impl CommandHelmClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::result::Result<String, String>> {
        tracing::debug!(args = ?args, "run helm");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    async fn run_ok(&self, args: &[&str]) -> Result<String> {
        self.run(args)
            .await?
            .map_err(|stderr| KubeError::HelmCommand(format!("{}: {}", args[0], stderr)))
    }
}

fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("not found")
}

#[async_trait]
impl HelmClient for CommandHelmClient {
    async fn render(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
        values_file: &Path,
    ) -> Result<String> {
        let chart = chart_dir.to_string_lossy();
        let values = values_file.to_string_lossy();
        self.run_ok(&["template", release, &chart, "--namespace", namespace, "--values", &values])
            .await
    }

    async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
        values_file: &Path,
        checksum: &str,
    ) -> Result<()> {
        let chart = chart_dir.to_string_lossy();
        let values = values_file.to_string_lossy();
        let checksum = format!("{}={}", CHECKSUM_VALUES_KEY, checksum);
        self.run_ok(&[
            "upgrade",
            release,
            &chart,
            "--install",
            "--create-namespace",
            "--namespace",
            namespace,
            "--values",
            &values,
            "--set-string",
            &checksum,
        ])
        .await?;
        Ok(())
    }

    async fn status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseInfo>> {
        let output = match self
            .run(&["status", release, "--namespace", namespace, "--output", "json"])
            .await?
        {
            Ok(output) => output,
            Err(stderr) if is_release_not_found(&stderr) => return Ok(None),
            Err(stderr) => return Err(KubeError::HelmCommand(format!("status: {}", stderr))),
        };
        let status: StatusOutput = serde_json::from_str(&output)?;

        let values = self
            .run_ok(&["get", "values", release, "--namespace", namespace, "--output", "json"])
            .await?;
        let values: JsonValue = serde_json::from_str(&values)?;

        Ok(Some(ReleaseInfo {
            revision: status.version,
            status: status.info.status,
            checksum: values
                .get(CHECKSUM_VALUES_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }))
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        match self.run(&["uninstall", release, "--namespace", namespace]).await? {
            Ok(_) => Ok(()),
            Err(stderr) if is_release_not_found(&stderr) => {
                tracing::debug!(release = %release, "release already uninstalled");
                Ok(())
            }
            Err(stderr) => Err(KubeError::HelmCommand(format!("uninstall: {}", stderr))),
        }
    }
}

/// An in-memory release of [`MockHelmClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct MockRelease {
    pub revision: u64,
    pub status: String,
    pub checksum: String,
    pub values: JsonValue,
}

#[derive(Default)]
struct MockHelmState {
    releases: HashMap<String, MockRelease>,
    renders: usize,
    upgrades: usize,
    uninstalls: usize,
    fail_render: bool,
    fail_upgrade: bool,
}

/// Helm client keeping releases in memory, for testing.
///
/// Rendering concatenates `templates/*.yaml` in name order.
#[derive(Default)]
pub struct MockHelmClient {
    state: Mutex<MockHelmState>,
}

impl MockHelmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self, release: &str) -> Option<MockRelease> {
        self.state.lock().releases.get(release).cloned()
    }

    pub fn set_status(&self, release: &str, status: &str) {
        if let Some(r) = self.state.lock().releases.get_mut(release) {
            r.status = status.to_string();
        }
    }

    pub fn set_fail_render(&self, fail: bool) {
        self.state.lock().fail_render = fail;
    }

    pub fn set_fail_upgrade(&self, fail: bool) {
        self.state.lock().fail_upgrade = fail;
    }

    pub fn render_count(&self) -> usize {
        self.state.lock().renders
    }

    pub fn upgrade_count(&self) -> usize {
        self.state.lock().upgrades
    }

    pub fn uninstall_count(&self) -> usize {
        self.state.lock().uninstalls
    }
}

#[async_trait]
impl HelmClient for MockHelmClient {
    async fn render(
        &self,
        _namespace: &str,
        _release: &str,
        chart_dir: &Path,
        values_file: &Path,
    ) -> Result<String> {
        {
            let mut state = self.state.lock();
            state.renders += 1;
            if state.fail_render {
                return Err(KubeError::InvalidManifest("render failed".to_string()));
            }
        }

        let mut templates = Vec::new();
        let dir = chart_dir.join(TEMPLATES_DIR);
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "yaml") {
                    templates.push(path);
                }
            }
        }
        templates.sort();

        let mut manifest = String::new();
        for path in templates {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            manifest.push_str(&format!("---\n# Source: templates/{}\n", name));
            manifest.push_str(&std::fs::read_to_string(&path)?);
            manifest.push('\n');
        }

        // Values changes show up as manifest changes
        let values = std::fs::read(values_file)?;
        manifest.push_str(&format!("# values: {}\n", hex::encode(Sha256::digest(&values))));
        Ok(manifest)
    }

    async fn upgrade(
        &self,
        _namespace: &str,
        release: &str,
        _chart_dir: &Path,
        values_file: &Path,
        checksum: &str,
    ) -> Result<()> {
        let values: JsonValue = serde_yaml::from_str(&std::fs::read_to_string(values_file)?)?;

        let mut state = self.state.lock();
        state.upgrades += 1;
        if state.fail_upgrade {
            return Err(KubeError::InvalidManifest("upgrade failed".to_string()));
        }

        let revision = state.releases.get(release).map(|r| r.revision).unwrap_or(0) + 1;
        state.releases.insert(
            release.to_string(),
            MockRelease {
                revision,
                status: "deployed".to_string(),
                checksum: checksum.to_string(),
                values,
            },
        );
        Ok(())
    }

    async fn status(&self, _namespace: &str, release: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self.state.lock().releases.get(release).map(|r| ReleaseInfo {
            revision: r.revision,
            status: r.status.clone(),
            checksum: Some(r.checksum.clone()),
        }))
    }

    async fn uninstall(&self, _namespace: &str, release: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.uninstalls += 1;
        state.releases.remove(release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MockResourceChecker;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        chart: PathBuf,
        tmp: PathBuf,
        client: Arc<MockHelmClient>,
        checker: Arc<MockResourceChecker>,
        service: HelmService,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let chart = dir.path().join("echo");
        std::fs::create_dir_all(chart.join("templates")).unwrap();
        std::fs::write(chart.join("Chart.yaml"), "name: echo\nversion: 0.1.0\n").unwrap();
        std::fs::write(
            chart.join("templates/deployment.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: echo\n",
        )
        .unwrap();

        let tmp = dir.path().join("tmp");
        let client = Arc::new(MockHelmClient::new());
        let checker = Arc::new(MockResourceChecker::new());
        let service = HelmService::new(
            client.clone(),
            checker.clone(),
            &tmp,
            Duration::from_secs(180),
        );

        Fixture {
            _dir: dir,
            chart,
            tmp,
            client,
            checker,
            service,
        }
    }

    fn request(chart: &Path, values: JsonValue) -> ReleaseRequest {
        ReleaseRequest {
            name: "echo".to_string(),
            namespace: "d8-echo".to_string(),
            chart_dir: chart.to_path_buf(),
            values,
            package: PackageMeta {
                name: "echo".to_string(),
                version: "v1.0.0".to_string(),
                ..Default::default()
            },
            global: json!({"discovery": {"kubernetesVersion": "1.31.0"}}),
        }
    }

    #[tokio::test]
    async fn test_upgrade_installs_once() {
        let f = fixture();
        let req = request(&f.chart, json!({"foo": 1}));

        f.service.upgrade(&req).await.unwrap();
        let release = f.client.release("echo").unwrap();
        assert_eq!(release.revision, 1);
        assert_eq!(release.values["foo"], 1);
        assert_eq!(release.values["Package"]["Name"], "echo");
        assert_eq!(release.values["Global"]["discovery"]["kubernetesVersion"], "1.31.0");
        assert!(f.service.has_monitor("echo"));

        // Nothing changed
        f.service.upgrade(&req).await.unwrap();
        assert_eq!(f.client.upgrade_count(), 1);
        assert_eq!(f.client.release("echo").unwrap().revision, 1);

        // Values files are cleaned up
        assert_eq!(std::fs::read_dir(&f.tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upgrade_conditions() {
        let f = fixture();
        f.service.upgrade(&request(&f.chart, json!({"foo": 1}))).await.unwrap();

        // Changed values
        f.service.upgrade(&request(&f.chart, json!({"foo": 2}))).await.unwrap();
        assert_eq!(f.client.release("echo").unwrap().revision, 2);

        // Failed release
        f.client.set_status("echo", "failed");
        f.service.upgrade(&request(&f.chart, json!({"foo": 2}))).await.unwrap();
        assert_eq!(f.client.release("echo").unwrap().revision, 3);

        // Absent resources
        f.checker.set_missing("d8-echo/Deployment/echo", true);
        f.service.upgrade(&request(&f.chart, json!({"foo": 2}))).await.unwrap();
        assert_eq!(f.client.release("echo").unwrap().revision, 4);
    }

    #[tokio::test]
    async fn test_not_a_chart() {
        let f = fixture();
        let empty = f.chart.parent().unwrap().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let err = f.service.upgrade(&request(&empty, json!({}))).await.unwrap_err();
        assert!(err.is_not_helm());
        assert_eq!(f.client.render_count(), 0);

        let err = f.service.render(&request(&empty, json!({}))).await.unwrap_err();
        assert!(err.is_not_helm());
    }

    #[tokio::test]
    async fn test_helm_steps_in_errors() {
        let f = fixture();

        f.client.set_fail_render(true);
        let err = f.service.upgrade(&request(&f.chart, json!({}))).await.unwrap_err();
        assert!(matches!(err, KubeError::Helm { step: HelmStep::Render, .. }));

        f.client.set_fail_render(false);
        f.client.set_fail_upgrade(true);
        let err = f.service.upgrade(&request(&f.chart, json!({}))).await.unwrap_err();
        assert!(matches!(err, KubeError::Helm { step: HelmStep::Install, .. }));
        assert!(!f.service.has_monitor("echo"));

        let err = f.service.upgrade(&request(&f.chart, json!([1]))).await.unwrap_err();
        assert!(matches!(err, KubeError::Helm { step: HelmStep::MarshalRuntimeValues, .. }));
    }

    #[tokio::test]
    async fn test_render_and_monitors() {
        let f = fixture();
        let manifest = f.service.render(&request(&f.chart, json!({}))).await.unwrap();
        assert!(manifest.contains("# Source: templates/deployment.yaml"));
        assert!(manifest.contains("kind: Deployment"));

        f.service.upgrade(&request(&f.chart, json!({}))).await.unwrap();
        f.service.pause_monitor("echo");
        assert_eq!(f.service.is_monitor_paused("echo"), Some(true));

        // A replaced monitor keeps the pause
        f.service.upgrade(&request(&f.chart, json!({"x": 1}))).await.unwrap();
        assert_eq!(f.service.is_monitor_paused("echo"), Some(true));

        f.service.resume_monitor("echo");
        assert_eq!(f.service.is_monitor_paused("echo"), Some(false));

        f.service.delete("echo", "d8-echo").await.unwrap();
        assert!(!f.service.has_monitor("echo"));
        assert!(f.client.release("echo").is_none());
        assert_eq!(f.client.uninstall_count(), 1);
    }

    #[test]
    fn test_release_not_found_detection() {
        assert!(is_release_not_found("Error: release: not found"));
        assert!(!is_release_not_found("Error: Kubernetes cluster unreachable"));
    }
}
