//! Hook configuration
//!
//! A hook prints its configuration when run with `--config`. The document
//! uses the shell-operator layout:
//!
//! ```yaml
//! configVersion: v1
//! onStartup: 10
//! beforeHelm: 5
//! schedule:
//!   - name: cleanup
//!     crontab: "*/10 * * * *"
//! kubernetes:
//!   - name: pods
//!     apiVersion: v1
//!     kind: Pod
//!     executeHookOnEvent: [Added, Deleted]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{KubeError, Result};

/// Queue name meaning "the package's own queue"
pub const MAIN_QUEUE: &str = "main";

/// Kind of event a hook can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingType {
    OnStartup,
    BeforeHelm,
    AfterHelm,
    AfterDeleteHelm,
    Schedule,
    #[serde(rename = "kubernetes")]
    OnKubernetesEvent,
}

impl BindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingType::OnStartup => "onStartup",
            BindingType::BeforeHelm => "beforeHelm",
            BindingType::AfterHelm => "afterHelm",
            BindingType::AfterDeleteHelm => "afterDeleteHelm",
            BindingType::Schedule => "schedule",
            BindingType::OnKubernetesEvent => "kubernetes",
        }
    }

    /// Lifecycle bindings receive every Kubernetes snapshot of the hook
    pub fn is_helm_phase(&self) -> bool {
        matches!(
            self,
            BindingType::BeforeHelm | BindingType::AfterHelm | BindingType::AfterDeleteHelm
        )
    }
}

impl std::fmt::Display for BindingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub const ALL: [WatchEventType; 3] = [
        WatchEventType::Added,
        WatchEventType::Modified,
        WatchEventType::Deleted,
    ];
}

/// Parsed hook configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_startup: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_helm: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_helm: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_delete_helm: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedule: Vec<ScheduleConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes: Vec<KubernetesConfig>,

    /// The hook validates settings before they are applied
    #[serde(default)]
    pub settings_check: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessConfig>,
}

fn default_config_version() -> String {
    "v1".to_string()
}

fn default_queue() -> String {
    MAIN_QUEUE.to_string()
}

fn default_true() -> bool {
    true
}

/// A cron binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default)]
    pub name: String,

    pub crontab: String,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default)]
    pub allow_failure: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,
}

/// A Kubernetes resource binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<NameSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<FieldSelector>,

    /// Event types that run the hook; all of them when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_hook_on_event: Option<Vec<WatchEventType>>,

    #[serde(default = "default_true")]
    pub execute_hook_on_synchronization: bool,

    #[serde(default = "default_true")]
    pub wait_for_synchronization: bool,

    #[serde(default)]
    pub allow_failure: bool,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,

    #[serde(default = "default_true")]
    pub keep_full_objects_in_memory: bool,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl KubernetesConfig {
    pub fn reacts_to(&self, event: WatchEventType) -> bool {
        match &self.execute_hook_on_event {
            Some(events) => events.contains(&event),
            None => true,
        }
    }

    /// Namespaces to watch; empty means all namespaces
    pub fn namespaces(&self) -> Vec<String> {
        self.namespace
            .as_ref()
            .and_then(|ns| ns.name_selector.as_ref())
            .map(|sel| sel.match_names.clone())
            .unwrap_or_default()
    }

    /// Object names to watch; empty means all names
    pub fn names(&self) -> &[String] {
        self.name_selector
            .as_ref()
            .map(|sel| sel.match_names.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameSelector {
    #[serde(default)]
    pub match_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<NameSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    /// Render as a Kubernetes label selector query
    pub fn to_query(&self) -> Result<String> {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        for req in &self.match_expressions {
            let part = match req.operator.as_str() {
                "In" => format!("{} in ({})", req.key, req.values.join(",")),
                "NotIn" => format!("{} notin ({})", req.key, req.values.join(",")),
                "Exists" => req.key.clone(),
                "DoesNotExist" => format!("!{}", req.key),
                other => {
                    return Err(KubeError::InvalidManifest(format!(
                        "unsupported label selector operator '{}'",
                        other
                    )));
                }
            };
            parts.push(part);
        }

        Ok(parts.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    #[serde(default)]
    pub match_expressions: Vec<FieldSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSelectorRequirement {
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl FieldSelector {
    /// Render as a Kubernetes field selector query
    pub fn to_query(&self) -> Result<String> {
        self.match_expressions
            .iter()
            .map(|req| {
                let op = match req.operator.as_str() {
                    "=" | "==" | "Equals" => "=",
                    "!=" | "NotEquals" => "!=",
                    other => {
                        return Err(KubeError::InvalidManifest(format!(
                            "unsupported field selector operator '{}'",
                            other
                        )));
                    }
                };
                Ok(format!("{}{}{}", req.field, op, req.value))
            })
            .collect::<Result<Vec<_>>>()
            .map(|parts| parts.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crontab: Option<String>,
}

impl HookConfig {
    /// Parse the `--config` output of a hook (YAML or JSON)
    pub fn parse(hook: &str, text: &str) -> Result<Self> {
        let invalid = |message: String| KubeError::HookConfig {
            hook: hook.to_string(),
            message,
        };

        if text.trim().is_empty() {
            return Err(invalid("empty configuration".to_string()));
        }

        let mut config: HookConfig =
            serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;

        if !matches!(config.config_version.as_str(), "v0" | "v1") {
            return Err(invalid(format!(
                "unsupported configVersion '{}'",
                config.config_version
            )));
        }

        for (i, sched) in config.schedule.iter_mut().enumerate() {
            if sched.crontab.trim().is_empty() {
                return Err(invalid(format!("schedule[{}] has an empty crontab", i)));
            }
            if sched.name.is_empty() {
                sched.name = sched.crontab.clone();
            }
        }

        let mut seen = HashSet::new();
        for (i, kube) in config.kubernetes.iter_mut().enumerate() {
            if kube.kind.trim().is_empty() {
                return Err(invalid(format!("kubernetes[{}] has no kind", i)));
            }
            if kube.name.is_empty() {
                kube.name = format!("kubernetes-{}", i);
            }
            if !seen.insert(kube.name.clone()) {
                return Err(invalid(format!(
                    "duplicate kubernetes binding '{}'",
                    kube.name
                )));
            }
        }

        Ok(config)
    }

    /// Binding types this hook declares
    pub fn bindings(&self) -> Vec<BindingType> {
        let mut out = Vec::new();
        if self.on_startup.is_some() {
            out.push(BindingType::OnStartup);
        }
        if self.before_helm.is_some() {
            out.push(BindingType::BeforeHelm);
        }
        if self.after_helm.is_some() {
            out.push(BindingType::AfterHelm);
        }
        if self.after_delete_helm.is_some() {
            out.push(BindingType::AfterDeleteHelm);
        }
        if !self.schedule.is_empty() {
            out.push(BindingType::Schedule);
        }
        if !self.kubernetes.is_empty() {
            out.push(BindingType::OnKubernetesEvent);
        }
        out
    }

    pub fn has_binding(&self, binding: BindingType) -> bool {
        self.bindings().contains(&binding)
    }

    /// Priority of the hook within a binding (lower runs first)
    pub fn order(&self, binding: BindingType) -> f64 {
        match binding {
            BindingType::OnStartup => self.on_startup,
            BindingType::BeforeHelm => self.before_helm,
            BindingType::AfterHelm => self.after_helm,
            BindingType::AfterDeleteHelm => self.after_delete_helm,
            BindingType::Schedule | BindingType::OnKubernetesEvent => None,
        }
        .unwrap_or(0.0)
    }

    /// Queues referenced by schedule and Kubernetes bindings
    pub fn queues(&self) -> Vec<String> {
        self.schedule
            .iter()
            .map(|s| s.queue.clone())
            .chain(self.kubernetes.iter().map(|k| k.queue.clone()))
            .collect()
    }
}
