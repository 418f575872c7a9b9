//! Package directory loading
//!
//! A package directory looks like:
//!
//! ```text
//! echo/
//!   package.yaml              # definition (or module.yaml)
//!   values.yaml               # static values
//!   images_digests.json
//!   openapi/config-values.yaml
//!   openapi/values.yaml
//!   hooks/...                 # executables
//!   Chart.yaml, templates/    # optional Helm chart
//! ```

use packwarden_core::{
    CoreError, Definition, OpenApiSchema, Values, ValuesStorage, inject_registry_property,
    load_digests,
};
use packwarden_kube::{Hook, HookConfig, HookExecutor, ObjectPatcher};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app::{Application, ApplicationParts};
use crate::error::{Result, RuntimeError};

const VALUES_FILE: &str = "values.yaml";
const CONFIG_SCHEMA_FILE: &str = "openapi/config-values.yaml";
const VALUES_SCHEMA_FILE: &str = "openapi/values.yaml";
const HOOKS_DIR: &str = "hooks";

/// Directories under `hooks/` that never hold hooks
const SKIPPED_DIRS: [&str; 2] = ["venv", "lib"];

/// Builds [`Application`]s from package directories
pub struct PackageLoader {
    executor: Arc<dyn HookExecutor>,
    patcher: Arc<dyn ObjectPatcher>,
}

impl PackageLoader {
    pub fn new(executor: Arc<dyn HookExecutor>, patcher: Arc<dyn ObjectPatcher>) -> Self {
        Self { executor, patcher }
    }

    /// Load a package. Nothing is kept when any part fails.
    pub async fn load(
        &self,
        name: &str,
        path: &Path,
        namespace: Option<&str>,
    ) -> Result<Application> {
        if !path.is_dir() {
            return Err(CoreError::DefinitionNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let definition = match Definition::load(path)? {
            Some(definition) if definition.name != name => {
                return Err(CoreError::InvalidDefinition {
                    message: format!(
                        "definition name '{}' does not match package '{}'",
                        definition.name, name
                    ),
                }
                .into());
            }
            Some(definition) => definition,
            None => Definition::with_name(name),
        };

        let static_values = read_values(&path.join(VALUES_FILE))?;
        let config_schema = OpenApiSchema::from_bytes(&read_optional(&path.join(CONFIG_SCHEMA_FILE))?)?;
        let values_schema = match OpenApiSchema::from_bytes(&read_optional(&path.join(VALUES_SCHEMA_FILE))?)? {
            Some(schema) => {
                let mut raw = schema.raw().clone();
                inject_registry_property(&mut raw);
                Some(OpenApiSchema::from_value(raw)?)
            }
            None => None,
        };
        let values = ValuesStorage::with_schemas(name, static_values, config_schema, values_schema);

        let hooks = self.discover_hooks(name, path).await?;
        let digests = load_digests(path)?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| definition.namespace());

        tracing::debug!(
            package = %name,
            path = %path.display(),
            hooks = hooks.len(),
            "package loaded"
        );

        Ok(Application::new(
            ApplicationParts {
                definition,
                path: path.to_path_buf(),
                namespace,
                digests,
                values,
                hooks,
            },
            Arc::clone(&self.executor),
            Arc::clone(&self.patcher),
        ))
    }

    async fn discover_hooks(&self, package: &str, path: &Path) -> Result<Vec<Hook>> {
        let files = hook_files(&path.join(HOOKS_DIR));
        let root = path.parent().unwrap_or(path);

        let mut hooks = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .to_string_lossy()
                .into_owned();
            let text = self.executor.config(&file).await?;
            let config = HookConfig::parse(&name, &text)?;
            hooks.push(Hook::new(name, file, config));
        }

        let settings_checks = hooks.iter().filter(|h| h.config.settings_check).count();
        if settings_checks > 1 {
            return Err(RuntimeError::InvalidHooks {
                package: package.to_string(),
                message: format!("{} settings check hooks, at most one allowed", settings_checks),
            });
        }
        let readiness = hooks.iter().filter(|h| h.config.readiness.is_some()).count();
        if readiness > 1 {
            return Err(RuntimeError::InvalidHooks {
                package: package.to_string(),
                message: format!("{} readiness hooks, at most one allowed", readiness),
            });
        }

        Ok(hooks)
    }
}

/// Executable files under `dir`, sorted by path
fn hook_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
        })
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .metadata()
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

fn read_optional(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn read_values(path: &Path) -> Result<Values> {
    let bytes = read_optional(path)?;
    if bytes.is_empty() {
        return Ok(Values::new());
    }
    let text = String::from_utf8_lossy(&bytes);
    Ok(Values::from_yaml(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use packwarden_kube::{BindingType, MockHookExecutor, RecordingPatcher};
    use serde_json::json;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn write_hook(path: &Path) {
        write(path, "#!/bin/sh\n");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn package(root: &Path) -> PathBuf {
        let dir = root.join("echo");
        write(
            &dir.join("package.yaml"),
            "name: echo\nversion: 0.3.1\nweight: 350\n",
        );
        write(&dir.join("values.yaml"), "replicas: 2\n");
        write(
            &dir.join("openapi/values.yaml"),
            "type: object\nproperties:\n  replicas:\n    type: integer\n",
        );
        write_hook(&dir.join("hooks/b_sync"));
        write_hook(&dir.join("hooks/a_startup"));
        write_hook(&dir.join("hooks/lib/helper"));
        write_hook(&dir.join("hooks/.cache/tool"));
        write(&dir.join("hooks/README.md"), "not a hook");
        dir
    }

    fn loader(dir: &Path) -> PackageLoader {
        let executor = MockHookExecutor::new()
            .with_config(dir.join("hooks/a_startup"), "configVersion: v1\nonStartup: 1")
            .with_config(dir.join("hooks/b_sync"), "configVersion: v1\nbeforeHelm: 10");
        PackageLoader::new(Arc::new(executor), Arc::new(RecordingPatcher::new()))
    }

    #[tokio::test]
    async fn test_load_package() {
        let tmp = TempDir::new().unwrap();
        let dir = package(tmp.path());

        let app = loader(&dir).load("echo", &dir, None).await.unwrap();
        assert_eq!(app.name(), "echo");
        assert_eq!(app.version(), Some("0.3.1"));
        assert_eq!(app.namespace(), "d8-echo");
        assert_eq!(app.constraints().order, 350);
        assert_eq!(app.values().get_values().get("replicas"), Some(&json!(2)));

        let names: Vec<String> = app.hooks().iter().map(|h| h.name.clone()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"echo/hooks/a_startup".to_string()));
        assert_eq!(app.hooks_by_binding(BindingType::BeforeHelm)[0].name, "echo/hooks/b_sync");
    }

    #[tokio::test]
    async fn test_namespace_override() {
        let tmp = TempDir::new().unwrap();
        let dir = package(tmp.path());
        let app = loader(&dir).load("echo", &dir, Some("custom")).await.unwrap();
        assert_eq!(app.namespace(), "custom");
    }

    #[tokio::test]
    async fn test_name_mismatch() {
        let tmp = TempDir::new().unwrap();
        let dir = package(tmp.path());
        let err = loader(&dir).load("other", &dir, None).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn test_two_settings_checks_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("echo");
        write_hook(&dir.join("hooks/check1"));
        write_hook(&dir.join("hooks/check2"));

        let executor = MockHookExecutor::new()
            .with_config(dir.join("hooks/check1"), "configVersion: v1\nsettingsCheck: true")
            .with_config(dir.join("hooks/check2"), "configVersion: v1\nsettingsCheck: true");
        let loader = PackageLoader::new(Arc::new(executor), Arc::new(RecordingPatcher::new()));

        let err = loader.load("echo", &dir, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidHooks { .. }));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("absent");
        assert!(loader(&dir).load("absent", &dir, None).await.is_err());
    }

    #[tokio::test]
    async fn test_without_definition_uses_name() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bare");
        std::fs::create_dir_all(&dir).unwrap();

        let app = loader(&dir).load("bare", &dir, None).await.unwrap();
        assert_eq!(app.name(), "bare");
        assert!(app.hooks().is_empty());
        assert!(app.version().is_none());
    }
}
