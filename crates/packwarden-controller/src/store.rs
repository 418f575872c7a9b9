//! Object store over the custom resources
//!
//! Controllers never talk to the API server directly; they go through a
//! [`ModuleStore`] per kind. [`KubeModuleStore`] is backed by `kube::Api`,
//! [`MockModuleStore`] keeps objects in memory and mimics finalizer-aware
//! deletion.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::crd::{Module, ModulePullOverride, ModuleRelease, ModuleSource, ModuleUpdatePolicy};
use crate::error::{ControllerError, Result};

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "packwarden";

/// Bounds shared by every stored kind
pub trait CustomObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> CustomObject for K where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

fn kind_of<K: CustomObject>() -> String {
    K::kind(&()).to_string()
}

/// Get, list, create, update and delete one kind of custom resource
#[async_trait]
pub trait ModuleStore<K: CustomObject>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>>;

    async fn list(&self) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; status is left untouched
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Request deletion; objects with finalizers stay until they are removed
    async fn delete(&self, name: &str) -> Result<()>;

    /// Like [`ModuleStore::get`], failing when the object is missing
    async fn fetch(&self, name: &str) -> Result<K> {
        self.get(name).await?.ok_or_else(|| ControllerError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        })
    }
}

// ============ Kubernetes ============

pub struct KubeModuleStore<K: CustomObject> {
    api: Api<K>,
}

impl<K: CustomObject> KubeModuleStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn map_write_error<K: CustomObject>(name: &str, e: kube::Error) -> ControllerError {
    match &e {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ControllerError::AlreadyExists {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => ControllerError::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 404 => ControllerError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        _ => ControllerError::Api(e),
    }
}

#[async_trait]
impl<K: CustomObject> ModuleStore<K> for KubeModuleStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&name, e))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&name, e))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        let patch = serde_json::json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": status,
        });
        self.api
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
            .map_err(|e| map_write_error::<K>(&name, e))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============ In-memory ============

/// In-memory store for tests
pub struct MockModuleStore<K: CustomObject> {
    objects: RwLock<BTreeMap<String, K>>,
    revision: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    status_updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl<K: CustomObject> Default for MockModuleStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            revision: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            status_updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }
}

impl<K: CustomObject> MockModuleStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as is, including its status
    pub fn insert(&self, mut obj: K) {
        self.stamp(&mut obj);
        self.objects.write().insert(obj.name_any(), obj);
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn status_update_count(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn stamp(&self, obj: &mut K) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(revision.to_string());
    }

    fn not_found(name: &str) -> ControllerError {
        ControllerError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        }
    }

    fn check_version(stored: &K, obj: &K) -> Result<()> {
        match (&obj.meta().resource_version, &stored.meta().resource_version) {
            (Some(given), Some(current)) if given != current => Err(ControllerError::Conflict {
                kind: kind_of::<K>(),
                name: obj.name_any(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<K: CustomObject> ModuleStore<K> for MockModuleStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.object(name))
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(ControllerError::AlreadyExists {
                kind: kind_of::<K>(),
                name,
            });
        }

        let mut created = obj.clone();
        created.meta_mut().creation_timestamp = Some(Time(Utc::now()));
        created.meta_mut().uid = Some(format!("uid-{}", name));
        self.stamp(&mut created);
        objects.insert(name, created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(stored, obj)?;

        // status belongs to the subresource
        let mut value = serde_json::to_value(obj)?;
        let stored_value = serde_json::to_value(stored)?;
        match stored_value.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        self.stamp(&mut updated);
        self.updates.fetch_add(1, Ordering::SeqCst);

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| Self::not_found(&name))?;

        let mut value = serde_json::to_value(stored)?;
        value["status"] = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        let mut updated: K = serde_json::from_value(value)?;
        self.stamp(&mut updated);
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        objects.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let Some(stored) = objects.get_mut(name) else {
            return Ok(());
        };
        self.deletes.fetch_add(1, Ordering::SeqCst);

        if stored.finalizers().is_empty() {
            objects.remove(name);
        } else if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            stored.meta_mut().resource_version = Some(revision.to_string());
        }
        Ok(())
    }
}

// ============ Bundles ============

/// One store per kind
#[derive(Clone)]
pub struct Stores {
    pub modules: Arc<dyn ModuleStore<Module>>,
    pub sources: Arc<dyn ModuleStore<ModuleSource>>,
    pub releases: Arc<dyn ModuleStore<ModuleRelease>>,
    pub overrides: Arc<dyn ModuleStore<ModulePullOverride>>,
    pub policies: Arc<dyn ModuleStore<ModuleUpdatePolicy>>,
}

impl Stores {
    pub fn kube(client: Client) -> Self {
        Self {
            modules: Arc::new(KubeModuleStore::new(client.clone())),
            sources: Arc::new(KubeModuleStore::new(client.clone())),
            releases: Arc::new(KubeModuleStore::new(client.clone())),
            overrides: Arc::new(KubeModuleStore::new(client.clone())),
            policies: Arc::new(KubeModuleStore::new(client)),
        }
    }
}

/// In-memory stores, keeping typed handles for assertions
#[derive(Clone, Default)]
pub struct MockStores {
    pub modules: Arc<MockModuleStore<Module>>,
    pub sources: Arc<MockModuleStore<ModuleSource>>,
    pub releases: Arc<MockModuleStore<ModuleRelease>>,
    pub overrides: Arc<MockModuleStore<ModulePullOverride>>,
    pub policies: Arc<MockModuleStore<ModuleUpdatePolicy>>,
}

impl MockStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        Stores {
            modules: self.modules.clone(),
            sources: self.sources.clone(),
            releases: self.releases.clone(),
            overrides: self.overrides.clone(),
            policies: self.policies.clone(),
        }
    }
}
