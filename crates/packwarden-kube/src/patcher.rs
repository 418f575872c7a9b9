//! Object patches requested by hooks
//!
//! Hooks write operations to the file at `KUBERNETES_PATCH_PATH`. The file is
//! a stream of JSON documents, each an operation or an array of operations:
//!
//! ```json
//! {"operation": "CreateOrUpdate", "object": {"apiVersion": "v1", "kind": "ConfigMap", ...}}
//! {"operation": "Delete", "apiVersion": "v1", "kind": "Secret", "namespace": "d8-echo", "name": "tls"}
//! ```

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy,
};
use packwarden_core::{PatchMode, ValuesPatch};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KubeError, Result};
use crate::resources::{FIELD_MANAGER, ResourceResolver};

/// Object addressed by delete and patch operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTarget {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

impl ObjectTarget {
    fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }
}

impl std::fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
        }
    }
}

/// One object operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all_fields = "camelCase")]
pub enum ObjectPatchOperation {
    Create {
        object: JsonValue,
    },
    CreateOrUpdate {
        object: JsonValue,
    },
    CreateIfNotExists {
        object: JsonValue,
    },
    Delete(ObjectTarget),
    DeleteInBackground(ObjectTarget),
    DeleteNonCascading(ObjectTarget),
    MergePatch {
        #[serde(flatten)]
        target: ObjectTarget,
        merge_patch: JsonValue,
        #[serde(default)]
        ignore_missing_object: bool,
    },
    #[serde(rename = "JSONPatch")]
    JsonPatch {
        #[serde(flatten)]
        target: ObjectTarget,
        json_patch: JsonValue,
        #[serde(default)]
        ignore_missing_object: bool,
    },
    #[serde(rename = "JQPatch")]
    JqPatch {
        #[serde(flatten)]
        target: ObjectTarget,
        jq_filter: String,
    },
}

impl ObjectPatchOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "Create",
            Self::CreateOrUpdate { .. } => "CreateOrUpdate",
            Self::CreateIfNotExists { .. } => "CreateIfNotExists",
            Self::Delete(_) => "Delete",
            Self::DeleteInBackground(_) => "DeleteInBackground",
            Self::DeleteNonCascading(_) => "DeleteNonCascading",
            Self::MergePatch { .. } => "MergePatch",
            Self::JsonPatch { .. } => "JSONPatch",
            Self::JqPatch { .. } => "JQPatch",
        }
    }
}

/// Parse the contents of a patch file
pub fn parse_object_patches(input: &str) -> Result<Vec<ObjectPatchOperation>> {
    let mut operations = Vec::new();

    for doc in serde_json::Deserializer::from_str(input).into_iter::<JsonValue>() {
        match doc? {
            JsonValue::Null => {}
            JsonValue::Array(items) => {
                for item in items {
                    operations.push(serde_json::from_value(item)?);
                }
            }
            item @ JsonValue::Object(_) => operations.push(serde_json::from_value(item)?),
            other => {
                return Err(KubeError::ObjectPatch(format!(
                    "unexpected document: {}",
                    other
                )));
            }
        }
    }

    Ok(operations)
}

/// Objects may also be given as a YAML or JSON string
fn object_of(object: &JsonValue) -> Result<DynamicObject> {
    let value = match object {
        JsonValue::String(text) => serde_yaml::from_str(text)?,
        other => other.clone(),
    };
    Ok(serde_json::from_value(value)?)
}

fn types_of(object: &DynamicObject) -> Result<(String, String)> {
    object
        .types
        .as_ref()
        .map(|t| (t.api_version.clone(), t.kind.clone()))
        .ok_or_else(|| KubeError::ObjectPatch("object is missing apiVersion or kind".to_string()))
}

fn name_of(object: &DynamicObject) -> Result<String> {
    object
        .metadata
        .name
        .clone()
        .ok_or_else(|| KubeError::ObjectPatch("object is missing metadata.name".to_string()))
}

/// Executes object operations
#[async_trait]
pub trait ObjectPatcher: Send + Sync {
    /// Run operations in order, stopping at the first failure
    async fn execute_operations(&self, operations: &[ObjectPatchOperation]) -> Result<()>;
}

/// Patcher applying operations to the cluster
pub struct KubeObjectPatcher {
    resolver: Arc<ResourceResolver>,
}

impl KubeObjectPatcher {
    pub fn new(resolver: Arc<ResourceResolver>) -> Self {
        Self { resolver }
    }

    fn api_for_object(&self, object: &DynamicObject) -> Result<Api<DynamicObject>> {
        let (api_version, kind) = types_of(object)?;
        self.resolver
            .api(&api_version, &kind, object.metadata.namespace.as_deref())
    }

    fn api_for_target(&self, target: &ObjectTarget) -> Result<Api<DynamicObject>> {
        self.resolver
            .api(&target.api_version, &target.kind, target.namespace())
    }

    async fn create(&self, object: &JsonValue, ignore_existing: bool) -> Result<()> {
        let object = object_of(object)?;
        let api = self.api_for_object(&object)?;

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = KubeError::from(e);
                if ignore_existing && e.is_already_exists() {
                    tracing::debug!(name = ?object.metadata.name, "object already exists");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn apply(&self, object: &JsonValue) -> Result<()> {
        let object = object_of(object)?;
        let api = self.api_for_object(&object)?;
        let name = name_of(&object)?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&object)).await?;
        Ok(())
    }

    async fn delete(&self, target: &ObjectTarget, policy: PropagationPolicy) -> Result<()> {
        let api = self.api_for_target(target)?;
        let params = DeleteParams {
            propagation_policy: Some(policy),
            ..Default::default()
        };

        match api.delete(&target.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                tracing::debug!(object = %target, "object already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_patch(
        &self,
        target: &ObjectTarget,
        merge_patch: &JsonValue,
        ignore_missing: bool,
    ) -> Result<()> {
        let api = self.api_for_target(target)?;
        let params = PatchParams::default();
        let patch = Patch::Merge(merge_patch);

        let result = if target.subresource.is_empty() {
            api.patch(&target.name, &params, &patch).await
        } else {
            api.patch_subresource(&target.subresource, &target.name, &params, &patch)
                .await
        };

        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 && ignore_missing => {
                tracing::debug!(object = %target, "skip patch of missing object");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn json_patch(
        &self,
        target: &ObjectTarget,
        json_patch: &JsonValue,
        ignore_missing: bool,
    ) -> Result<()> {
        let api = self.api_for_target(target)?;
        let patch: ValuesPatch = serde_json::from_value(json_patch.clone())?;

        let Some(current) = api.get_opt(&target.name).await? else {
            if ignore_missing {
                tracing::debug!(object = %target, "skip patch of missing object");
                return Ok(());
            }
            return Err(KubeError::ObjectPatch(format!("{} not found", target)));
        };

        let patched = patch.apply(&serde_json::to_value(&current)?, PatchMode::Strict)?;
        let patched: DynamicObject = serde_json::from_value(patched)?;
        api.replace(&target.name, &PostParams::default(), &patched)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectPatcher for KubeObjectPatcher {
    async fn execute_operations(&self, operations: &[ObjectPatchOperation]) -> Result<()> {
        for operation in operations {
            tracing::debug!(operation = operation.name(), "execute object operation");

            match operation {
                ObjectPatchOperation::Create { object } => self.create(object, false).await?,
                ObjectPatchOperation::CreateIfNotExists { object } => {
                    self.create(object, true).await?
                }
                ObjectPatchOperation::CreateOrUpdate { object } => self.apply(object).await?,
                ObjectPatchOperation::Delete(target) => {
                    self.delete(target, PropagationPolicy::Foreground).await?
                }
                ObjectPatchOperation::DeleteInBackground(target) => {
                    self.delete(target, PropagationPolicy::Background).await?
                }
                ObjectPatchOperation::DeleteNonCascading(target) => {
                    self.delete(target, PropagationPolicy::Orphan).await?
                }
                ObjectPatchOperation::MergePatch {
                    target,
                    merge_patch,
                    ignore_missing_object,
                } => {
                    self.merge_patch(target, merge_patch, *ignore_missing_object)
                        .await?
                }
                ObjectPatchOperation::JsonPatch {
                    target,
                    json_patch,
                    ignore_missing_object,
                } => {
                    self.json_patch(target, json_patch, *ignore_missing_object)
                        .await?
                }
                ObjectPatchOperation::JqPatch { target, .. } => {
                    return Err(KubeError::ObjectPatch(format!(
                        "JQPatch of {} is not supported",
                        target
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Patcher that records operations, for testing
#[derive(Default)]
pub struct RecordingPatcher {
    operations: Mutex<Vec<ObjectPatchOperation>>,
    fail: AtomicBool,
}

impl RecordingPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn operations(&self) -> Vec<ObjectPatchOperation> {
        self.operations.lock().clone()
    }
}

#[async_trait]
impl ObjectPatcher for RecordingPatcher {
    async fn execute_operations(&self, operations: &[ObjectPatchOperation]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(KubeError::ObjectPatch("patcher is failing".to_string()));
        }
        self.operations.lock().extend_from_slice(operations);
        Ok(())
    }
}
