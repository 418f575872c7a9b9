//! Per-package lifecycle bookkeeping
//!
//! Every package carries a phase, a cancellation token renewed on each
//! lifecycle event, and settings waiting to be applied.

use packwarden_core::Values;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Phase {
    #[default]
    Pending,
    Loaded,
    Running,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Loaded => "Loaded",
            Phase::Running => "Running",
        };
        f.write_str(s)
    }
}

/// Events that renew the package token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Update,
    Schedule,
    Disable,
    Delete,
}

#[derive(Debug, Default)]
struct Lifecycle {
    phase: Phase,
    cancel: CancellationToken,
    settings: Option<Values>,
    version: String,
}

/// Lifecycle state of every known package
#[derive(Debug, Default)]
pub struct LifecycleStore {
    packages: Mutex<HashMap<String, Lifecycle>>,
}

impl LifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the previous token of the package and return a fresh one
    pub fn renew(&self, name: &str, event: LifecycleEvent) -> CancellationToken {
        let mut packages = self.packages.lock();
        let lifecycle = packages.entry(name.to_string()).or_default();
        lifecycle.cancel.cancel();
        lifecycle.cancel = CancellationToken::new();
        tracing::trace!(package = %name, ?event, "lifecycle token renewed");
        lifecycle.cancel.clone()
    }

    /// Current token, without renewing it
    pub fn token(&self, name: &str) -> Option<CancellationToken> {
        self.packages.lock().get(name).map(|l| l.cancel.clone())
    }

    pub fn phase(&self, name: &str) -> Option<Phase> {
        self.packages.lock().get(name).map(|l| l.phase)
    }

    pub fn set_phase(&self, name: &str, phase: Phase) {
        if let Some(lifecycle) = self.packages.lock().get_mut(name) {
            tracing::debug!(package = %name, from = %lifecycle.phase, to = %phase, "phase changed");
            lifecycle.phase = phase;
        }
    }

    pub fn version(&self, name: &str) -> Option<String> {
        self.packages.lock().get(name).map(|l| l.version.clone())
    }

    pub fn set_version(&self, name: &str, version: &str) {
        let mut packages = self.packages.lock();
        packages.entry(name.to_string()).or_default().version = version.to_string();
    }

    /// Store settings to apply on the next startup
    pub fn set_pending_settings(&self, name: &str, settings: Values) {
        let mut packages = self.packages.lock();
        packages.entry(name.to_string()).or_default().settings = Some(settings);
    }

    pub fn take_pending_settings(&self, name: &str) -> Option<Values> {
        self.packages
            .lock()
            .get_mut(name)
            .and_then(|l| l.settings.take())
    }

    /// Latest settings, kept for later startups
    pub fn pending_settings(&self, name: &str) -> Option<Values> {
        self.packages
            .lock()
            .get(name)
            .and_then(|l| l.settings.clone())
    }

    /// Forget the package, cancelling its token
    pub fn remove(&self, name: &str) {
        if let Some(lifecycle) = self.packages.lock().remove(name) {
            lifecycle.cancel.cancel();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.lock().contains_key(name)
    }

    /// Cancel every token
    pub fn cancel_all(&self) {
        for lifecycle in self.packages.lock().values() {
            lifecycle.cancel.cancel();
        }
    }
}
