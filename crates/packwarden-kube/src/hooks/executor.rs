//! Hook execution
//!
//! [`ShellHookExecutor`] runs hook executables with the shell-operator file
//! protocol. Inputs are written as JSON files into a per-run directory and
//! the hook reports back through result files named by environment
//! variables.

use async_trait::async_trait;
use packwarden_core::ValuesPatch;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::binding_context::BindingContext;
use crate::error::{KubeError, Result};
use crate::patcher::{ObjectPatchOperation, parse_object_patches};

const BINDING_CONTEXT_FILE: &str = "binding_context.json";
const CONFIG_VALUES_FILE: &str = "config_values.json";
const VALUES_FILE: &str = "values.json";
const VALUES_PATCH_FILE: &str = "values_json_patch.json";
const CONFIG_VALUES_PATCH_FILE: &str = "config_values_json_patch.json";
const KUBERNETES_PATCH_FILE: &str = "kubernetes_patch.json";

/// Everything a hook run needs
#[derive(Debug, Clone, Default)]
pub struct HookInput {
    pub hook_name: String,
    pub path: PathBuf,
    pub binding_contexts: Vec<BindingContext>,
    pub config_values: JsonValue,
    /// Revision of `config_values`, bumped on every replacement
    pub config_version: u64,
    pub values: JsonValue,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

/// What a hook asked for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookResult {
    pub values_patch: ValuesPatch,
    pub config_values_patch: ValuesPatch,
    pub object_patches: Vec<ObjectPatchOperation>,
}

/// Outcome of a hook process.
///
/// A failed hook still reports its object patches; values patches of a
/// failed run are discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutput {
    pub result: HookResult,
    pub failure: Option<String>,
}

impl HookOutput {
    pub fn success(result: HookResult) -> Self {
        Self {
            result,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs hooks
#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Output of `<hook> --config`
    async fn config(&self, path: &Path) -> Result<String>;

    async fn execute(&self, input: HookInput, cancel: &CancellationToken) -> Result<HookOutput>;
}

/// Executor running hook executables
pub struct ShellHookExecutor {
    tmp_dir: PathBuf,
}

impl ShellHookExecutor {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
        }
    }

    async fn prepare(&self, input: &HookInput, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        tokio::fs::write(
            dir.join(BINDING_CONTEXT_FILE),
            serde_json::to_vec(&input.binding_contexts)?,
        )
        .await?;
        tokio::fs::write(
            dir.join(CONFIG_VALUES_FILE),
            serde_json::to_vec(&input.config_values)?,
        )
        .await?;
        tokio::fs::write(dir.join(VALUES_FILE), serde_json::to_vec(&input.values)?).await?;

        for file in [VALUES_PATCH_FILE, CONFIG_VALUES_PATCH_FILE, KUBERNETES_PATCH_FILE] {
            tokio::fs::write(dir.join(file), b"").await?;
        }
        Ok(())
    }

    async fn run(&self, input: &HookInput, dir: &Path, cancel: &CancellationToken) -> Result<HookOutput> {
        self.prepare(input, dir).await?;

        let env = [
            ("BINDING_CONTEXT_PATH", BINDING_CONTEXT_FILE),
            ("CONFIG_VALUES_PATH", CONFIG_VALUES_FILE),
            ("VALUES_PATH", VALUES_FILE),
            ("VALUES_JSON_PATCH_PATH", VALUES_PATCH_FILE),
            ("CONFIG_VALUES_JSON_PATCH_PATH", CONFIG_VALUES_PATCH_FILE),
            ("KUBERNETES_PATCH_PATH", KUBERNETES_PATCH_FILE),
        ];

        let mut command = Command::new(&input.path);
        command
            .envs(env.iter().map(|(k, f)| (*k, dir.join(f))))
            .env("CONFIG_VALUES_VERSION", input.config_version.to_string())
            .envs(&input.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parent) = input.path.parent() {
            command.current_dir(parent);
        }

        let child = command.spawn().map_err(|e| KubeError::HookFailed {
            hook: input.hook_name.clone(),
            message: format!("failed to start: {}", e),
        })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(KubeError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(hook = %input.hook_name, output = "stdout", "{}", line);
        }

        let object_patches = parse_object_patches(&read_result(dir, KUBERNETES_PATCH_FILE).await?)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("exit status {}", output.status),
                text => format!("{}: {}", output.status, text),
            };
            return Ok(HookOutput {
                result: HookResult {
                    object_patches,
                    ..Default::default()
                },
                failure: Some(message),
            });
        }

        Ok(HookOutput::success(HookResult {
            values_patch: ValuesPatch::from_json(&read_result(dir, VALUES_PATCH_FILE).await?)?,
            config_values_patch: ValuesPatch::from_json(
                &read_result(dir, CONFIG_VALUES_PATCH_FILE).await?,
            )?,
            object_patches,
        }))
    }
}

async fn read_result(dir: &Path, file: &str) -> Result<String> {
    match tokio::fs::read_to_string(dir.join(file)).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn config(&self, path: &Path) -> Result<String> {
        let output = Command::new(path)
            .arg("--config")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KubeError::HookConfig {
                hook: path.display().to_string(),
                message: format!("failed to start: {}", e),
            })?;

        if !output.status.success() {
            return Err(KubeError::HookConfig {
                hook: path.display().to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn execute(&self, input: HookInput, cancel: &CancellationToken) -> Result<HookOutput> {
        let dir = self.tmp_dir.join(uuid::Uuid::new_v4().to_string());
        let started = std::time::Instant::now();

        let result = self.run(&input, &dir, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(dir = %dir.display(), error = %e, "failed to remove hook run directory");
        }
        tracing::debug!(
            hook = %input.hook_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hook finished"
        );
        result
    }
}

/// A recorded hook run
#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
    pub hook: String,
    /// Binding names of the contexts, in order
    pub bindings: Vec<String>,
    pub config_version: u64,
    pub values: JsonValue,
}

/// Scripted executor for testing
#[derive(Default)]
pub struct MockHookExecutor {
    configs: Mutex<HashMap<PathBuf, String>>,
    results: Mutex<HashMap<String, VecDeque<HookOutput>>>,
    failing: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<HookCall>>,
}

impl MockHookExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config returned for a hook path
    pub fn with_config(self, path: impl Into<PathBuf>, config: impl Into<String>) -> Self {
        self.configs.lock().insert(path.into(), config.into());
        self
    }

    /// Queue an output for the next run of a hook
    pub fn push_output(&self, hook: &str, output: HookOutput) {
        self.results
            .lock()
            .entry(hook.to_string())
            .or_default()
            .push_back(output);
    }

    /// Make every run of a hook fail until cleared
    pub fn set_failing(&self, hook: &str, message: Option<&str>) {
        let mut failing = self.failing.lock();
        match message {
            Some(message) => {
                failing.insert(hook.to_string(), message.to_string());
            }
            None => {
                failing.remove(hook);
            }
        }
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    /// Names of hooks run so far, in order
    pub fn called_hooks(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.hook.clone()).collect()
    }

    pub fn call_count(&self, hook: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.hook == hook).count()
    }
}

#[async_trait]
impl HookExecutor for MockHookExecutor {
    async fn config(&self, path: &Path) -> Result<String> {
        self.configs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| KubeError::HookConfig {
                hook: path.display().to_string(),
                message: "no config".to_string(),
            })
    }

    async fn execute(&self, input: HookInput, cancel: &CancellationToken) -> Result<HookOutput> {
        if cancel.is_cancelled() {
            return Err(KubeError::Cancelled);
        }

        self.calls.lock().push(HookCall {
            hook: input.hook_name.clone(),
            bindings: input
                .binding_contexts
                .iter()
                .map(|c| c.binding.clone())
                .collect(),
            config_version: input.config_version,
            values: input.values.clone(),
        });

        if let Some(message) = self.failing.lock().get(&input.hook_name) {
            return Ok(HookOutput {
                result: HookResult::default(),
                failure: Some(message.clone()),
            });
        }

        Ok(self
            .results
            .lock()
            .get_mut(&input.hook_name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::BindingType;
    use packwarden_core::PatchOperation;
    use serde_json::json;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_hook(dir: &Path, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn input(name: &str, path: PathBuf) -> HookInput {
        HookInput {
            hook_name: name.to_string(),
            path,
            binding_contexts: vec![BindingContext::for_binding(BindingType::BeforeHelm)],
            config_values: json!({"echo": {"replicas": 2}}),
            config_version: 3,
            values: json!({"echo": {"replicas": 2, "internal": {}}}),
            env: BTreeMap::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_hook_protocol() {
        let hooks = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();

        let path = write_hook(
            hooks.path(),
            "set-token",
            r#"#!/bin/sh
grep -q beforeHelm "$BINDING_CONTEXT_PATH" || exit 3
grep -q replicas "$VALUES_PATH" || exit 4
[ "$CONFIG_VALUES_VERSION" = 3 ] || exit 5
echo '[{"op": "add", "path": "/echo/internal/token", "value": "abc"}]' > "$VALUES_JSON_PATCH_PATH"
echo '{"operation": "Delete", "apiVersion": "v1", "kind": "Secret", "namespace": "ns", "name": "old"}' > "$KUBERNETES_PATCH_PATH"
"#,
        );

        let executor = ShellHookExecutor::new(tmp.path());
        let output = executor
            .execute(input("echo/hooks/set-token", path), &CancellationToken::new())
            .await
            .unwrap();

        assert!(output.is_success());
        assert_eq!(
            output.result.values_patch,
            ValuesPatch::new(vec![PatchOperation::add("/echo/internal/token", json!("abc"))])
        );
        assert!(output.result.config_values_patch.is_empty());
        assert_eq!(output.result.object_patches.len(), 1);

        // Run directories are removed
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_hook_failure_keeps_object_patches() {
        let hooks = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();

        let path = write_hook(
            hooks.path(),
            "status",
            r#"#!/bin/sh
echo '[{"op": "add", "path": "/echo/x", "value": 1}]' > "$VALUES_JSON_PATCH_PATH"
echo '{"operation": "MergePatch", "apiVersion": "v1", "kind": "ConfigMap", "namespace": "ns", "name": "s", "mergePatch": {"data": {"ok": "false"}}}' > "$KUBERNETES_PATCH_PATH"
echo "boom" >&2
exit 1
"#,
        );

        let executor = ShellHookExecutor::new(tmp.path());
        let output = executor
            .execute(input("echo/hooks/status", path), &CancellationToken::new())
            .await
            .unwrap();

        let failure = output.failure.unwrap();
        assert!(failure.contains("boom"));
        assert!(output.result.values_patch.is_empty());
        assert_eq!(output.result.object_patches.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_hook_config() {
        let hooks = TempDir::new().unwrap();
        let path = write_hook(
            hooks.path(),
            "startup",
            "#!/bin/sh\nif [ \"$1\" = \"--config\" ]; then echo 'onStartup: 10'; fi\n",
        );

        let executor = ShellHookExecutor::new(hooks.path());
        let config = executor.config(&path).await.unwrap();
        assert_eq!(config.trim(), "onStartup: 10");
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let executor = MockHookExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .execute(input("echo/hooks/a", PathBuf::from("/x")), &cancel)
            .await;
        assert!(matches!(result, Err(KubeError::Cancelled)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mock_executor_scripts() {
        let executor = MockHookExecutor::new().with_config("/hooks/a", "onStartup: 1");
        assert_eq!(executor.config(Path::new("/hooks/a")).await.unwrap(), "onStartup: 1");
        assert!(executor.config(Path::new("/hooks/b")).await.is_err());

        let patch = ValuesPatch::new(vec![PatchOperation::remove("/echo/x")]);
        executor.push_output(
            "a",
            HookOutput::success(HookResult {
                values_patch: patch.clone(),
                ..Default::default()
            }),
        );
        executor.set_failing("b", Some("exit 1"));

        let cancel = CancellationToken::new();
        let first = executor.execute(input("a", "/x".into()), &cancel).await.unwrap();
        assert_eq!(first.result.values_patch, patch);

        let second = executor.execute(input("a", "/x".into()), &cancel).await.unwrap();
        assert!(second.result.values_patch.is_empty());

        let failed = executor.execute(input("b", "/x".into()), &cancel).await.unwrap();
        assert_eq!(failed.failure.as_deref(), Some("exit 1"));

        assert_eq!(executor.call_count("a"), 2);
        assert_eq!(executor.called_hooks(), vec!["a", "a", "b"]);
        assert_eq!(executor.calls()[0].bindings, vec!["beforeHelm"]);
    }
}
