//! Resolution of manifests and dynamic objects against the cluster
//!
//! Rendered Helm manifests and hook-produced objects carry only their
//! `apiVersion` and `kind`. The resolver uses cached discovery information to
//! turn them into dynamic APIs without compile-time type knowledge.

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DynamicObject},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use serde::Deserialize;

use crate::error::{KubeError, Result};

/// Field manager name for Server-Side Apply
pub const FIELD_MANAGER: &str = "packwarden";

/// Identity of one object of a rendered manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestHeader {
    api_version: Option<String>,
    kind: Option<String>,
    #[serde(default)]
    metadata: ManifestMetadata,
}

#[derive(Deserialize, Default)]
struct ManifestMetadata {
    name: Option<String>,
    namespace: Option<String>,
}

/// Split a multi-document manifest into object identities.
///
/// Documents that are empty or only contain comments are skipped. The
/// namespace is left as written; scope is only known after discovery.
pub fn parse_manifests(manifest: &str) -> Result<Vec<ManifestRef>> {
    let mut refs = Vec::new();

    for (index, doc) in split_documents(manifest).enumerate() {
        let header: ManifestHeader = serde_yaml::from_str(doc).map_err(|e| {
            KubeError::InvalidManifest(format!("failed to parse document {}: {}", index, e))
        })?;

        let (Some(api_version), Some(kind)) = (header.api_version, header.kind) else {
            return Err(KubeError::InvalidManifest(format!(
                "document {} is missing apiVersion or kind",
                index
            )));
        };
        let name = header.metadata.name.ok_or_else(|| {
            KubeError::InvalidManifest(format!("document {} is missing metadata.name", index))
        })?;

        refs.push(ManifestRef {
            api_version,
            kind,
            namespace: header.metadata.namespace,
            name,
        });
    }

    Ok(refs)
}

fn split_documents(manifest: &str) -> impl Iterator<Item = &str> {
    manifest
        .split("\n---")
        .map(|doc| doc.trim_start_matches("---").trim())
        .filter(|doc| {
            !doc.is_empty()
                && !doc
                    .lines()
                    .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
        })
}

/// Convert `apiVersion` and `kind` to a GroupVersionKind
///
/// - "apps/v1" -> group="apps", version="v1"
/// - "v1" -> group="", version="v1" (core API)
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };

    GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    }
}

/// Checks whether manifest objects exist in the cluster
#[async_trait]
pub trait ResourceChecker: Send + Sync {
    async fn exists(&self, resource: &ManifestRef, default_namespace: &str) -> Result<bool>;
}

/// Discovery-backed resolver for dynamic objects
pub struct ResourceResolver {
    client: Client,
    discovery: Discovery,
}

impl ResourceResolver {
    /// Run discovery once and keep the result
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self { client, discovery })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let gvk = gvk_from_api_version(api_version, kind);
        self.discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| KubeError::UnknownResource {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            })
    }

    /// Dynamic API for an object, namespaced when the resource is
    pub fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = self.resolve(api_version, kind)?;
        Ok(if capabilities.scope == Scope::Namespaced {
            Api::namespaced_with(self.client.clone(), namespace.unwrap_or("default"), &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        })
    }
}

#[async_trait]
impl ResourceChecker for ResourceResolver {
    async fn exists(&self, resource: &ManifestRef, default_namespace: &str) -> Result<bool> {
        let namespace = resource.namespace.as_deref().unwrap_or(default_namespace);
        let api = self.api(&resource.api_version, &resource.kind, Some(namespace))?;
        Ok(api.get_opt(&resource.name).await?.is_some())
    }
}
