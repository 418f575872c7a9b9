//! Custom resources managed by the controllers
//!
//! All kinds live in `deckhouse.io/v1alpha1` and are cluster scoped.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::ControllerError;

// ============ Labels ============

pub const LABEL_MODULE: &str = "module";
pub const LABEL_SOURCE: &str = "source";
pub const LABEL_RELEASE_CHECKSUM: &str = "release-checksum";
pub const LABEL_UPDATE_POLICY: &str = "modules.deckhouse.io/update-policy";
pub const LABEL_STATUS: &str = "status";

// ============ Annotations ============

pub const ANNOTATION_APPROVED: &str = "modules.deckhouse.io/approved";
pub const ANNOTATION_FORCE_DELETE: &str = "modules.deckhouse.io/force-delete";
pub const ANNOTATION_REGISTRY_CHECKSUM: &str = "modules.deckhouse.io/registry-spec-checksum";
pub const ANNOTATION_REGISTRY_CHANGED: &str = "modules.deckhouse.io/registry-spec-changed";
pub const ANNOTATION_RENEW: &str = "renew";

// ============ Finalizers ============

pub const FINALIZER_EXIST_ON_FS: &str = "modules.deckhouse.io/exist-on-fs";
pub const FINALIZER_RELEASE_EXISTS: &str = "modules.deckhouse.io/release-exists";
pub const FINALIZER_MODULE_EXISTS: &str = "modules.deckhouse.io/module-exists";

/// Schema for free-form objects
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    }
    .into()
}

// ============ Module ============

/// A module known to the cluster
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "Module",
    plural = "modules",
    status = "ModuleStatus"
)]
#[kube(printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".spec.weight"}"#)]
#[kube(printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_channel: Option<String>,
    #[serde(default)]
    pub available_sources: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default)]
    pub conditions: Vec<ModuleCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Module {
    /// Embedded modules ship with the platform and cannot be overridden
    pub fn is_embedded(&self) -> bool {
        matches!(self.spec.source.as_deref(), Some("Embedded"))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.spec.state.as_deref(), Some("Disabled"))
    }
}

// ============ ModuleSource ============

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleSource",
    plural = "modulesources",
    status = "ModuleSourceStatus"
)]
#[kube(printcolumn = r#"{"name":"Count","type":"integer","jsonPath":".status.modulesCount"}"#)]
#[kube(printcolumn = r#"{"name":"Sync","type":"date","jsonPath":".status.syncTime"}"#)]
#[kube(printcolumn = r#"{"name":"Msg","type":"string","jsonPath":".status.message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSourceSpec {
    pub registry: RegistrySpec,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_channel: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_cfg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
}

impl RegistrySpec {
    pub fn to_config(&self) -> crate::error::Result<packwarden_repo::RegistryConfig> {
        let mut config = packwarden_repo::RegistryConfig::new(&self.repo)
            .with_scheme(self.scheme.parse()?);
        if !self.docker_cfg.is_empty() {
            config = config.with_docker_cfg(&self.docker_cfg);
        }
        if !self.ca.is_empty() {
            config = config.with_ca(&self.ca);
        }
        Ok(config)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modules_count: usize,
    #[serde(default)]
    pub available_modules: Vec<AvailableModule>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModule {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overridden: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_error: String,
}

// ============ ModuleRelease ============

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ReleasePhase {
    #[default]
    Pending,
    Deployed,
    Superseded,
    Suspended,
    Skipped,
    Terminating,
}

impl ReleasePhase {
    /// Value of the `status` label
    pub fn label(&self) -> String {
        self.to_string().to_lowercase()
    }

    /// Phases kept only as history
    pub fn is_outdated(&self) -> bool {
        matches!(
            self,
            ReleasePhase::Superseded | ReleasePhase::Suspended | ReleasePhase::Skipped
        )
    }
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleasePhase::Pending => "Pending",
            ReleasePhase::Deployed => "Deployed",
            ReleasePhase::Superseded => "Superseded",
            ReleasePhase::Suspended => "Suspended",
            ReleasePhase::Skipped => "Skipped",
            ReleasePhase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleRelease",
    plural = "modulereleases",
    status = "ModuleReleaseStatus"
)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReleaseSpec {
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub changelog: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReleaseStatus {
    #[serde(default)]
    pub phase: ReleasePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub pull_duration: Option<Duration>,
}

impl ModuleRelease {
    /// Phase, `None` before the first reconcile
    pub fn phase(&self) -> Option<ReleasePhase> {
        self.status.as_ref().map(|s| s.phase)
    }

    pub fn message(&self) -> &str {
        self.status.as_ref().map(|s| s.message.as_str()).unwrap_or_default()
    }

    pub fn version(&self) -> crate::error::Result<Version> {
        let raw = self.spec.version.trim_start_matches('v');
        Version::parse(raw).map_err(|e| ControllerError::InvalidVersion {
            version: self.spec.version.clone(),
            message: e.to_string(),
        })
    }

    pub fn is_approved(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_APPROVED)
            .is_some_and(|v| v == "true")
    }

    pub fn update_policy(&self) -> Option<&str> {
        self.labels().get(LABEL_UPDATE_POLICY).map(String::as_str)
    }

    /// Set the phase and message, stamping the transition time on change
    pub fn set_phase(&mut self, phase: ReleasePhase, message: impl Into<String>) {
        let status = self.status.get_or_insert_with(Default::default);
        if status.phase != phase || status.transition_time.is_none() {
            status.transition_time = Some(Utc::now());
        }
        status.phase = phase;
        status.message = message.into();
        self.labels_mut()
            .insert(LABEL_STATUS.to_string(), phase.label());
    }
}

// ============ ModulePullOverride ============

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModulePullOverride",
    plural = "modulepulloverrides",
    shortname = "mpo",
    status = "ModulePullOverrideStatus"
)]
#[kube(printcolumn = r#"{"name":"Updated","type":"date","jsonPath":".status.updatedAt"}"#)]
#[kube(printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ModulePullOverrideSpec {
    pub source: String,
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub scan_interval: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModulePullOverrideStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_digest: String,
    #[serde(default)]
    pub weight: u32,
}

// ============ ModuleUpdatePolicy ============

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UpdateMode {
    #[default]
    Auto,
    Manual,
    Ignore,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleUpdatePolicy",
    plural = "moduleupdatepolicies",
    shortname = "mup"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleUpdatePolicySpec {
    #[serde(default)]
    pub update: UpdateSpec,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_release_selector: Option<ModuleReleaseSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSpec {
    #[serde(default)]
    pub mode: UpdateMode,
    #[serde(default)]
    pub windows: Vec<UpdateWindow>,
}

/// Time range in UTC, `HH:MM`, optionally limited to week days (`Mon`..`Sun`)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWindow {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub days: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReleaseSelector {
    #[serde(default)]
    pub label_selector: LabelSelector,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    /// `In`, `NotIn`, `Exists` or `DoesNotExist`
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    /// An empty selector matches everything
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self.match_expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator.as_str() {
                    "In" => value.is_some_and(|v| req.values.contains(v)),
                    "NotIn" => value.is_none_or(|v| !req.values.contains(v)),
                    "Exists" => value.is_some(),
                    "DoesNotExist" => value.is_none(),
                    _ => false,
                }
            })
    }
}

// ============ Finalizers ============

/// Finalizer helpers shared by every kind
pub trait FinalizerExt: ResourceExt {
    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Returns true when the finalizer was added
    fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers_mut().push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was removed
    fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != finalizer);
        before != self.finalizers().len()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

impl<K: ResourceExt> FinalizerExt for K {}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crds_are_cluster_scoped() {
        for crd in [
            Module::crd(),
            ModuleSource::crd(),
            ModuleRelease::crd(),
            ModulePullOverride::crd(),
            ModuleUpdatePolicy::crd(),
        ] {
            assert_eq!(crd.spec.group, "deckhouse.io");
            assert_eq!(crd.spec.scope, "Cluster");
            assert_eq!(crd.spec.versions[0].name, "v1alpha1");
        }
    }

    #[test]
    fn test_release_phase_and_status_label() {
        let mut release = ModuleRelease::new(
            "echo-v1.2.3",
            ModuleReleaseSpec {
                module_name: "echo".to_string(),
                version: "v1.2.3".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(release.phase(), None);
        assert_eq!(release.version().unwrap(), Version::new(1, 2, 3));

        release.set_phase(ReleasePhase::Deployed, "");
        assert_eq!(release.phase(), Some(ReleasePhase::Deployed));
        assert_eq!(release.labels()[LABEL_STATUS], "deployed");
        assert!(release.status.as_ref().unwrap().transition_time.is_some());
    }

    #[test]
    fn test_release_status_serialization() {
        let status = ModuleReleaseStatus {
            phase: ReleasePhase::Superseded,
            pull_duration: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Superseded");
        assert_eq!(json["pullDuration"], "2s");
    }

    #[test]
    fn test_finalizers() {
        let mut source = ModuleSource::new("deckhouse", ModuleSourceSpec::default());
        assert!(source.add_finalizer(FINALIZER_RELEASE_EXISTS));
        assert!(!source.add_finalizer(FINALIZER_RELEASE_EXISTS));
        assert!(source.has_finalizer(FINALIZER_RELEASE_EXISTS));
        assert!(source.remove_finalizer(FINALIZER_RELEASE_EXISTS));
        assert!(source.finalizers().is_empty());
        assert!(!source.is_deleting());
    }

    #[test]
    fn test_label_selector() {
        let labels: BTreeMap<String, String> = [
            ("module".to_string(), "echo".to_string()),
            ("source".to_string(), "deckhouse".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(LabelSelector::default().matches(&labels));

        let selector = LabelSelector {
            match_labels: [("module".to_string(), "echo".to_string())].into_iter().collect(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "source".to_string(),
                operator: "In".to_string(),
                values: vec!["deckhouse".to_string()],
            }],
        };
        assert!(selector.matches(&labels));

        let other = LabelSelector {
            match_expressions: vec![LabelSelectorRequirement {
                key: "module".to_string(),
                operator: "DoesNotExist".to_string(),
                values: vec![],
            }],
            ..Default::default()
        };
        assert!(!other.matches(&labels));
    }

    #[test]
    fn test_registry_spec_to_config() {
        let spec = RegistrySpec {
            repo: "registry.example.com/modules".to_string(),
            scheme: "HTTP".to_string(),
            ..Default::default()
        };
        let config = spec.to_config().unwrap();
        assert_eq!(config.scheme, packwarden_repo::Scheme::Http);
        assert!(config.docker_cfg.is_none());
    }
}
