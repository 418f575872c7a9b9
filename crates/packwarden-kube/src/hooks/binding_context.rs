//! Binding contexts handed to hooks

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::config::{BindingType, WatchEventType};

/// Snapshots keyed by Kubernetes binding name
pub type Snapshots = BTreeMap<String, Vec<ObjectAndFilterResult>>;

/// Why a hook is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextType {
    Synchronization,
    Event,
    Schedule,
}

/// An object as seen by a hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectAndFilterResult {
    pub object: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_result: Option<JsonValue>,
}

impl From<JsonValue> for ObjectAndFilterResult {
    fn from(object: JsonValue) -> Self {
        Self {
            object,
            filter_result: None,
        }
    }
}

/// Data that drives snapshot refreshes, never sent to the hook
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingContextMetadata {
    pub binding_type: Option<BindingType>,
    pub include_snapshots_from: Vec<String>,
    pub include_all_snapshots: bool,
    pub monitor_id: Option<String>,
}

/// One element of the `binding_context.json` array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingContext {
    pub binding: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<ContextType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_event: Option<WatchEventType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectAndFilterResult>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshots: Snapshots,

    #[serde(skip)]
    pub metadata: BindingContextMetadata,
}

impl BindingContext {
    /// Context for a lifecycle binding (`onStartup`, `beforeHelm`, ...)
    pub fn for_binding(binding: BindingType) -> Self {
        Self {
            binding: binding.as_str().to_string(),
            metadata: BindingContextMetadata {
                binding_type: Some(binding),
                include_all_snapshots: binding.is_helm_phase(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// A hook run requested by a binding, ready to become a task
#[derive(Debug, Clone, PartialEq)]
pub struct BindingExecutionInfo {
    pub binding: String,
    pub binding_type: BindingType,
    pub contexts: Vec<BindingContext>,
    pub queue: String,
    pub allow_failure: bool,
    /// Initial synchronization of a Kubernetes binding
    pub is_synchronization: bool,
    /// Monitors to unlock once the run completes
    pub unlock_monitors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_context_serialization() {
        let ctx = BindingContext {
            binding: "pods".to_string(),
            context_type: Some(ContextType::Event),
            watch_event: Some(WatchEventType::Added),
            object: Some(json!({"kind": "Pod"})),
            ..Default::default()
        };

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            value,
            json!({
                "binding": "pods",
                "type": "Event",
                "watchEvent": "Added",
                "object": {"kind": "Pod"}
            })
        );
    }

    #[test]
    fn test_lifecycle_context() {
        let ctx = BindingContext::for_binding(BindingType::BeforeHelm);
        assert!(ctx.metadata.include_all_snapshots);
        assert_eq!(serde_json::to_value(&ctx).unwrap(), json!({"binding": "beforeHelm"}));

        let startup = BindingContext::for_binding(BindingType::OnStartup);
        assert!(!startup.metadata.include_all_snapshots);
    }
}
