//! Values shared by every package
//!
//! The discovery section feeds the scheduler's environment checks.

use packwarden_core::{Values, parse_version};
use parking_lot::RwLock;
use semver::Version;
use serde_json::Value as JsonValue;

const KUBERNETES_VERSION: &str = "discovery.kubernetesVersion";
const PLATFORM_VERSION: &str = "discovery.version";
const BOOTSTRAPPED: &str = "clusterIsBootstrapped";

#[derive(Debug, Default)]
pub struct GlobalValues {
    values: RwLock<Values>,
}

impl GlobalValues {
    pub fn new(values: Values) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn get(&self) -> Values {
        self.values.read().clone()
    }

    pub fn set(&self, path: &str, value: JsonValue) {
        self.values.write().set(path, value);
    }

    pub fn replace(&self, values: Values) {
        *self.values.write() = values;
    }

    pub fn kubernetes_version(&self) -> Result<Version, String> {
        self.version_at(KUBERNETES_VERSION)
    }

    pub fn platform_version(&self) -> Result<Version, String> {
        self.version_at(PLATFORM_VERSION)
    }

    pub fn set_kubernetes_version(&self, version: &str) {
        self.set(KUBERNETES_VERSION, JsonValue::String(version.to_string()));
    }

    pub fn set_platform_version(&self, version: &str) {
        self.set(PLATFORM_VERSION, JsonValue::String(version.to_string()));
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.values
            .read()
            .get(BOOTSTRAPPED)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    pub fn set_bootstrapped(&self, bootstrapped: bool) {
        self.set(BOOTSTRAPPED, JsonValue::Bool(bootstrapped));
    }

    fn version_at(&self, path: &str) -> Result<Version, String> {
        let values = self.values.read();
        let raw = values
            .get(path)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| format!("{} is not set", path))?;
        parse_version(raw).map_err(|e| e.to_string())
    }
}
