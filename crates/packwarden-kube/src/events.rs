//! Kubernetes events manager
//!
//! Monitors watch one resource kind each and keep the current objects as a
//! snapshot. A monitor starts locked: events are buffered until the initial
//! synchronization of its binding has run, then flushed in arrival order.

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    Client,
    api::{Api, DynamicObject, ListParams},
    core::TypeMeta,
    discovery::Scope,
    runtime::{WatchStreamExt, watcher},
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{KubeError, Result};
use crate::hooks::{KubernetesConfig, WatchEventType};
use crate::resources::ResourceResolver;

/// What a monitor watches
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// `<hook>/<binding>/<n>`
    pub id: String,
    pub api_version: String,
    pub kind: String,
    /// Empty means all namespaces
    pub namespaces: Vec<String>,
    /// Empty means all names
    pub names: Vec<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl MonitorConfig {
    pub fn from_binding(id: impl Into<String>, binding: &KubernetesConfig) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            api_version: binding.api_version.clone(),
            kind: binding.kind.clone(),
            namespaces: binding.namespaces(),
            names: binding.names().to_vec(),
            label_selector: binding
                .label_selector
                .as_ref()
                .map(|s| s.to_query())
                .transpose()?
                .filter(|q| !q.is_empty()),
            field_selector: binding
                .field_selector
                .as_ref()
                .map(|s| s.to_query())
                .transpose()?
                .filter(|q| !q.is_empty()),
        })
    }

    fn accepts(&self, object: &JsonValue) -> bool {
        if self.names.is_empty() {
            return true;
        }
        object_name(object).is_some_and(|name| self.names.iter().any(|n| n == name))
    }
}

/// An event delivered by a monitor
#[derive(Debug, Clone, PartialEq)]
pub struct KubeEvent {
    pub monitor_id: String,
    pub watch_event: WatchEventType,
    pub object: JsonValue,
}

/// Source of Kubernetes events for hook bindings
#[async_trait]
pub trait KubeEventsManager: Send + Sync {
    /// Register a monitor and return the objects that currently exist.
    ///
    /// The monitor starts locked.
    async fn add_monitor(&self, config: MonitorConfig) -> Result<Vec<JsonValue>>;

    /// Deliver buffered and future events of a monitor
    fn unlock_monitor(&self, id: &str);

    fn stop_monitor(&self, id: &str);

    fn has_monitor(&self, id: &str) -> bool;

    /// Current objects of a monitor, sorted by namespace and name
    fn snapshot(&self, id: &str) -> Vec<JsonValue>;

    /// Take the event stream; only the first call gets it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<KubeEvent>>;

    /// Stop every monitor
    fn stop(&self);
}

fn object_name(object: &JsonValue) -> Option<&str> {
    object.pointer("/metadata/name").and_then(|v| v.as_str())
}

fn object_key(object: &JsonValue) -> String {
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    format!("{}/{}", namespace, object_name(object).unwrap_or(""))
}

struct Monitor {
    config: MonitorConfig,
    objects: RwLock<BTreeMap<String, JsonValue>>,
    /// `Some` while locked
    buffer: Mutex<Option<Vec<KubeEvent>>>,
    cancel: CancellationToken,
}

impl Monitor {
    fn new(config: MonitorConfig, objects: &[JsonValue]) -> Self {
        let objects = objects
            .iter()
            .map(|o| (object_key(o), o.clone()))
            .collect();
        Self {
            config,
            objects: RwLock::new(objects),
            buffer: Mutex::new(Some(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    fn contains(&self, object: &JsonValue) -> bool {
        self.objects.read().contains_key(&object_key(object))
    }

    fn apply(
        &self,
        watch_event: WatchEventType,
        object: JsonValue,
        tx: &mpsc::UnboundedSender<KubeEvent>,
    ) {
        if !self.config.accepts(&object) {
            return;
        }

        {
            let mut objects = self.objects.write();
            let key = object_key(&object);
            match watch_event {
                WatchEventType::Deleted => {
                    objects.remove(&key);
                }
                _ => {
                    objects.insert(key, object.clone());
                }
            }
        }

        let event = KubeEvent {
            monitor_id: self.config.id.clone(),
            watch_event,
            object,
        };

        let mut buffer = self.buffer.lock();
        match buffer.as_mut() {
            Some(pending) => pending.push(event),
            None => {
                let _ = tx.send(event);
            }
        }
    }

    fn unlock(&self, tx: &mpsc::UnboundedSender<KubeEvent>) {
        let pending = self.buffer.lock().take();
        for event in pending.into_iter().flatten() {
            let _ = tx.send(event);
        }
    }

    fn snapshot(&self) -> Vec<JsonValue> {
        self.objects.read().values().cloned().collect()
    }
}

/// Monitor bookkeeping shared by the real and the mock manager
struct MonitorSet {
    monitors: RwLock<HashMap<String, Arc<Monitor>>>,
    tx: mpsc::UnboundedSender<KubeEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<KubeEvent>>>,
}

impl MonitorSet {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            monitors: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn insert(&self, monitor: Arc<Monitor>) {
        let previous = self
            .monitors
            .write()
            .insert(monitor.config.id.clone(), monitor);
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Monitor>> {
        self.monitors.read().get(id).cloned()
    }

    fn unlock(&self, id: &str) {
        if let Some(monitor) = self.get(id) {
            monitor.unlock(&self.tx);
        }
    }

    fn remove(&self, id: &str) {
        if let Some(monitor) = self.monitors.write().remove(id) {
            monitor.cancel.cancel();
        }
    }

    fn snapshot(&self, id: &str) -> Vec<JsonValue> {
        self.get(id).map(|m| m.snapshot()).unwrap_or_default()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<KubeEvent>> {
        self.rx.lock().take()
    }

    fn stop_all(&self) {
        for (_, monitor) in self.monitors.write().drain() {
            monitor.cancel.cancel();
        }
    }
}

/// Events manager backed by Kubernetes watches
pub struct KubeWatcherEventsManager {
    client: Client,
    resolver: Arc<ResourceResolver>,
    set: MonitorSet,
}

impl KubeWatcherEventsManager {
    pub fn new(client: Client, resolver: Arc<ResourceResolver>) -> Self {
        Self {
            client,
            resolver,
            set: MonitorSet::new(),
        }
    }

    fn apis_for(&self, config: &MonitorConfig) -> Result<Vec<Api<DynamicObject>>> {
        let (resource, capabilities) = self.resolver.resolve(&config.api_version, &config.kind)?;

        if capabilities.scope == Scope::Namespaced && !config.namespaces.is_empty() {
            Ok(config
                .namespaces
                .iter()
                .map(|ns| Api::namespaced_with(self.client.clone(), ns, &resource))
                .collect())
        } else {
            Ok(vec![Api::all_with(self.client.clone(), &resource)])
        }
    }
}

fn with_types(mut obj: DynamicObject, config: &MonitorConfig) -> Result<JsonValue> {
    // List responses omit apiVersion/kind on items
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: config.api_version.clone(),
            kind: config.kind.clone(),
        });
    }
    Ok(serde_json::to_value(&obj)?)
}

#[async_trait]
impl KubeEventsManager for KubeWatcherEventsManager {
    async fn add_monitor(&self, config: MonitorConfig) -> Result<Vec<JsonValue>> {
        let apis = self.apis_for(&config)?;

        let mut list_params = ListParams::default();
        let mut watch_config = watcher::Config::default();
        if let Some(labels) = &config.label_selector {
            list_params = list_params.labels(labels);
            watch_config = watch_config.labels(labels);
        }
        if let Some(fields) = &config.field_selector {
            list_params = list_params.fields(fields);
            watch_config = watch_config.fields(fields);
        }

        let mut initial = Vec::new();
        for api in &apis {
            for obj in api.list(&list_params).await? {
                let value = with_types(obj, &config)?;
                if config.accepts(&value) {
                    initial.push(value);
                }
            }
        }

        let monitor = Arc::new(Monitor::new(config.clone(), &initial));
        self.set.insert(Arc::clone(&monitor));

        for api in apis {
            let monitor = Arc::clone(&monitor);
            let tx = self.set.tx.clone();
            let stream = watcher(api, watch_config.clone()).default_backoff();

            let span = tracing::info_span!("monitor", id = %monitor.config.id);

            tokio::spawn(async move {
                let mut stream = Box::pin(stream);

                loop {
                    let next = tokio::select! {
                        _ = monitor.cancel.cancelled() => break,
                        next = stream.next() => next,
                    };

                    let event = match next {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "watch failed");
                            continue;
                        }
                        None => break,
                    };

                    let (deleted, obj) = match event {
                        watcher::Event::Apply(obj) => (false, obj),
                        watcher::Event::Delete(obj) => (true, obj),
                        // Relists only refresh the cache
                        watcher::Event::InitApply(obj) => {
                            if let Ok(value) = with_types(obj, &monitor.config) {
                                if monitor.config.accepts(&value) {
                                    monitor.objects.write().insert(object_key(&value), value);
                                }
                            }
                            continue;
                        }
                        watcher::Event::Init | watcher::Event::InitDone => continue,
                    };

                    let value = match with_types(obj, &monitor.config) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(error = %e, "skip undecodable object");
                            continue;
                        }
                    };

                    let watch_event = if deleted {
                        WatchEventType::Deleted
                    } else if monitor.contains(&value) {
                        WatchEventType::Modified
                    } else {
                        WatchEventType::Added
                    };
                    monitor.apply(watch_event, value, &tx);
                }

                tracing::debug!("monitor stopped");
            }.instrument(span));
        }

        tracing::debug!(monitor = %config.id, kind = %config.kind, objects = initial.len(), "monitor added");
        Ok(initial)
    }

    fn unlock_monitor(&self, id: &str) {
        self.set.unlock(id);
    }

    fn stop_monitor(&self, id: &str) {
        self.set.remove(id);
    }

    fn has_monitor(&self, id: &str) -> bool {
        self.set.get(id).is_some()
    }

    fn snapshot(&self, id: &str) -> Vec<JsonValue> {
        self.set.snapshot(id)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<KubeEvent>> {
        self.set.take_events()
    }

    fn stop(&self) {
        self.set.stop_all();
    }
}

/// In-memory events manager for testing
pub struct MockKubeEventsManager {
    set: MonitorSet,
    /// Objects by kind
    objects: Mutex<HashMap<String, Vec<JsonValue>>>,
    added: Mutex<Vec<String>>,
}

impl MockKubeEventsManager {
    pub fn new() -> Self {
        Self {
            set: MonitorSet::new(),
            objects: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
        }
    }

    /// Seed an object returned by the initial listing of monitors
    pub fn with_object(self, object: JsonValue) -> Self {
        let kind = object["kind"].as_str().unwrap_or_default().to_string();
        self.objects.lock().entry(kind).or_default().push(object);
        self
    }

    /// Deliver an event to every monitor watching the object's kind
    pub fn emit(&self, watch_event: WatchEventType, object: JsonValue) {
        let kind = object["kind"].as_str().unwrap_or_default().to_string();
        let monitors: Vec<_> = self
            .set
            .monitors
            .read()
            .values()
            .filter(|m| m.config.kind == kind)
            .cloned()
            .collect();

        for monitor in monitors {
            monitor.apply(watch_event, object.clone(), &self.set.tx);
        }
    }

    /// Ids of monitors registered so far, in order
    pub fn added_monitors(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.set
            .get(id)
            .map(|m| m.buffer.lock().is_some())
            .unwrap_or(false)
    }
}

impl Default for MockKubeEventsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KubeEventsManager for MockKubeEventsManager {
    async fn add_monitor(&self, config: MonitorConfig) -> Result<Vec<JsonValue>> {
        if config.kind.is_empty() {
            return Err(KubeError::UnknownResource {
                api_version: config.api_version,
                kind: config.kind,
            });
        }

        let initial: Vec<JsonValue> = self
            .objects
            .lock()
            .get(&config.kind)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|o| config.accepts(o))
            .filter(|o| {
                config.namespaces.is_empty()
                    || o.pointer("/metadata/namespace")
                        .and_then(|v| v.as_str())
                        .is_some_and(|ns| config.namespaces.iter().any(|n| n == ns))
            })
            .collect();

        self.added.lock().push(config.id.clone());
        self.set
            .insert(Arc::new(Monitor::new(config, &initial)));
        Ok(initial)
    }

    fn unlock_monitor(&self, id: &str) {
        self.set.unlock(id);
    }

    fn stop_monitor(&self, id: &str) {
        self.set.remove(id);
    }

    fn has_monitor(&self, id: &str) -> bool {
        self.set.get(id).is_some()
    }

    fn snapshot(&self, id: &str) -> Vec<JsonValue> {
        self.set.snapshot(id)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<KubeEvent>> {
        self.set.take_events()
    }

    fn stop(&self) {
        self.set.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> JsonValue {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "d8-echo"}
        })
    }

    fn config(id: &str) -> MonitorConfig {
        MonitorConfig {
            id: id.to_string(),
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespaces: vec![],
            names: vec![],
            label_selector: None,
            field_selector: None,
        }
    }

    #[tokio::test]
    async fn test_initial_listing() {
        let manager = MockKubeEventsManager::new()
            .with_object(pod("a"))
            .with_object(pod("b"));

        let objects = manager.add_monitor(config("h/pods/0")).await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(manager.snapshot("h/pods/0").len(), 2);
    }

    #[tokio::test]
    async fn test_locked_monitor_buffers_events() {
        let manager = MockKubeEventsManager::new();
        let mut events = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        manager.add_monitor(config("h/pods/0")).await.unwrap();
        manager.emit(WatchEventType::Added, pod("a"));
        manager.emit(WatchEventType::Added, pod("b"));

        assert!(events.try_recv().is_err());
        assert_eq!(manager.snapshot("h/pods/0").len(), 2);

        manager.unlock_monitor("h/pods/0");
        assert_eq!(events.try_recv().unwrap().object, pod("a"));
        assert_eq!(events.try_recv().unwrap().object, pod("b"));

        manager.emit(WatchEventType::Deleted, pod("a"));
        let deleted = events.try_recv().unwrap();
        assert_eq!(deleted.watch_event, WatchEventType::Deleted);
        assert_eq!(manager.snapshot("h/pods/0").len(), 1);
    }

    #[tokio::test]
    async fn test_name_selector() {
        let manager = MockKubeEventsManager::new()
            .with_object(pod("keep"))
            .with_object(pod("other"));

        let mut cfg = config("h/pods/0");
        cfg.names = vec!["keep".to_string()];
        let objects = manager.add_monitor(cfg).await.unwrap();

        assert_eq!(objects, vec![pod("keep")]);
    }

    #[tokio::test]
    async fn test_stop_monitor() {
        let manager = MockKubeEventsManager::new();
        manager.add_monitor(config("h/pods/0")).await.unwrap();
        assert!(manager.has_monitor("h/pods/0"));

        manager.stop_monitor("h/pods/0");
        assert!(!manager.has_monitor("h/pods/0"));
        assert!(manager.snapshot("h/pods/0").is_empty());
    }

    #[test]
    fn test_monitor_config_from_binding() {
        let binding: KubernetesConfig = serde_yaml::from_str(
            r#"
name: secrets
kind: Secret
nameSelector:
  matchNames: [tls]
labelSelector:
  matchLabels:
    app: echo
"#,
        )
        .unwrap();

        let cfg = MonitorConfig::from_binding("h/secrets/0", &binding).unwrap();
        assert_eq!(cfg.api_version, "v1");
        assert_eq!(cfg.names, vec!["tls".to_string()]);
        assert_eq!(cfg.label_selector.as_deref(), Some("app=echo"));
        assert!(cfg.field_selector.is_none());
    }
}
