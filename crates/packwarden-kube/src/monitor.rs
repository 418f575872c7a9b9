//! Resource monitor for installed releases
//!
//! Periodically checks that every object of a release's rendered manifest
//! still exists and reports the package when something is gone.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::Result;
use crate::resources::{ManifestRef, ResourceChecker};

/// Called with the package name when resources are absent
pub type AbsentCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Watches the objects of one release
pub struct ResourceMonitor {
    package: String,
    namespace: String,
    resources: Vec<ManifestRef>,
    checker: Arc<dyn ResourceChecker>,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl ResourceMonitor {
    pub fn new(
        package: impl Into<String>,
        namespace: impl Into<String>,
        resources: Vec<ManifestRef>,
        checker: Arc<dyn ResourceChecker>,
    ) -> Self {
        Self {
            package: package.into(),
            namespace: namespace.into(),
            resources,
            checker,
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn resources(&self) -> &[ManifestRef] {
        &self.resources
    }

    /// Objects of the manifest missing from the cluster
    pub async fn absent_resources(&self) -> Result<Vec<ManifestRef>> {
        let mut absent = Vec::new();
        for resource in &self.resources {
            if !self.checker.exists(resource, &self.namespace).await? {
                absent.push(resource.clone());
            }
        }
        Ok(absent)
    }

    /// Check in the background every `interval`
    pub fn start(self: &Arc<Self>, interval: Duration, on_absent: AbsentCallback) {
        let monitor = Arc::clone(self);
        let span = tracing::info_span!("resource_monitor", package = %monitor.package);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = monitor.cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    if monitor.is_paused() {
                        continue;
                    }

                    match monitor.absent_resources().await {
                        Ok(absent) if absent.is_empty() => {}
                        Ok(absent) => {
                            let names: Vec<String> = absent.iter().map(|r| r.to_string()).collect();
                            tracing::warn!(absent = ?names, "release resources are absent");
                            on_absent(&monitor.package);
                        }
                        Err(e) => tracing::warn!(error = %e, "resource check failed"),
                    }
                }

                tracing::debug!("resource monitor stopped");
            }
            .instrument(span),
        );
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Checker answering from a set of missing objects, for testing
#[derive(Default)]
pub struct MockResourceChecker {
    missing: Mutex<HashSet<String>>,
}

impl MockResourceChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an object (`Kind/name`, or `namespace/Kind/name`) as missing
    pub fn set_missing(&self, resource: &str, missing: bool) {
        let mut set = self.missing.lock();
        if missing {
            set.insert(resource.to_string());
        } else {
            set.remove(resource);
        }
    }
}

#[async_trait]
impl ResourceChecker for MockResourceChecker {
    async fn exists(&self, resource: &ManifestRef, default_namespace: &str) -> Result<bool> {
        let namespaced = format!(
            "{}/{}/{}",
            resource.namespace.as_deref().unwrap_or(default_namespace),
            resource.kind,
            resource.name
        );
        let cluster = format!("{}/{}", resource.kind, resource.name);

        let missing = self.missing.lock();
        Ok(!missing.contains(&namespaced) && !missing.contains(&cluster))
    }
}
