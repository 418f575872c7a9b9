//! Package status conditions
//!
//! The [`StatusService`] keeps the latest conditions of every package and
//! hands changes to the registered [`StatusSink`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};

/// Condition kinds reported for a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    ReadyInRuntime,
    ReadyInCluster,
    SettingsValid,
    HooksProcessed,
    HelmApplied,
}

impl ConditionType {
    pub const ALL: [ConditionType; 5] = [
        ConditionType::ReadyInRuntime,
        ConditionType::ReadyInCluster,
        ConditionType::SettingsValid,
        ConditionType::HooksProcessed,
        ConditionType::HelmApplied,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn ready(condition_type: ConditionType) -> Self {
        Self {
            condition_type,
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn failed(
        condition_type: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            status: ConditionStatus::False,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Receives package conditions, e.g. to write them into a custom resource
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, package: &str, conditions: &[Condition]) -> Result<()>;
}

/// Latest conditions of every package
#[derive(Default)]
pub struct StatusService {
    packages: RwLock<HashMap<String, BTreeMap<ConditionType, Condition>>>,
    sinks: RwLock<Vec<Arc<dyn StatusSink>>>,
}

impl StatusService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.sinks.write().push(sink);
    }

    /// Merge conditions into the package status and publish the result.
    ///
    /// The transition time of a condition is kept while its status does not
    /// change.
    pub async fn set_conditions(&self, package: &str, conditions: Vec<Condition>) {
        let current = {
            let mut packages = self.packages.write();
            let entry = packages.entry(package.to_string()).or_default();
            for mut condition in conditions {
                if let Some(previous) = entry.get(&condition.condition_type) {
                    if previous.status == condition.status {
                        condition.last_transition_time = previous.last_transition_time;
                    }
                }
                entry.insert(condition.condition_type, condition);
            }
            entry.values().cloned().collect::<Vec<_>>()
        };

        self.publish(package, &current).await;
    }

    /// Report the conditions carried by a lifecycle error
    pub async fn handle_error(&self, package: &str, error: &RuntimeError) {
        if let RuntimeError::Package(e) = error {
            self.set_conditions(package, e.conditions.clone()).await;
        }
    }

    /// Mark the package fully processed
    pub async fn set_ready(&self, package: &str, helm_applied: bool) {
        let mut conditions = vec![
            Condition::ready(ConditionType::ReadyInRuntime),
            Condition::ready(ConditionType::SettingsValid),
            Condition::ready(ConditionType::HooksProcessed),
        ];
        if helm_applied {
            conditions.push(Condition::ready(ConditionType::HelmApplied));
            conditions.push(Condition::ready(ConditionType::ReadyInCluster));
        }
        self.set_conditions(package, conditions).await;
    }

    pub fn get(&self, package: &str) -> Vec<Condition> {
        self.packages
            .read()
            .get(package)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn condition(&self, package: &str, condition_type: ConditionType) -> Option<Condition> {
        self.packages
            .read()
            .get(package)
            .and_then(|c| c.get(&condition_type).cloned())
    }

    pub fn remove(&self, package: &str) {
        self.packages.write().remove(package);
    }

    async fn publish(&self, package: &str, conditions: &[Condition]) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            if let Err(e) = sink.publish(package, conditions).await {
                tracing::warn!(package = %package, error = %e, "failed to publish status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorReason, PackageError};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn publish(&self, package: &str, conditions: &[Condition]) -> Result<()> {
            self.published
                .lock()
                .push((package.to_string(), conditions.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transition_time_kept_while_unchanged() {
        let service = StatusService::new();
        service
            .set_conditions("echo", vec![Condition::ready(ConditionType::HelmApplied)])
            .await;
        let first = service
            .condition("echo", ConditionType::HelmApplied)
            .unwrap()
            .last_transition_time;

        service
            .set_conditions("echo", vec![Condition::ready(ConditionType::HelmApplied)])
            .await;
        let second = service
            .condition("echo", ConditionType::HelmApplied)
            .unwrap();
        assert_eq!(second.last_transition_time, first);
    }

    #[tokio::test]
    async fn test_error_conditions_replace_ready() {
        let service = StatusService::new();
        let sink = Arc::new(RecordingSink::default());
        service.add_sink(sink.clone());

        service.set_ready("echo", true).await;
        assert!(
            service
                .condition("echo", ConditionType::ReadyInRuntime)
                .unwrap()
                .is_true()
        );

        let error = RuntimeError::from(PackageError::new(
            ErrorReason::LoadFailed,
            RuntimeError::PackageNotFound("echo".to_string()),
        ));
        service.handle_error("echo", &error).await;

        let ready = service
            .condition("echo", ConditionType::ReadyInRuntime)
            .unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "LoadFailed");
        assert_eq!(service.get("echo").len(), 5);

        let published = sink.published.lock().clone();
        assert_eq!(published, vec![("echo".to_string(), 5), ("echo".to_string(), 5)]);
    }

    #[tokio::test]
    async fn test_remove() {
        let service = StatusService::new();
        service.set_ready("echo", false).await;
        assert_eq!(service.get("echo").len(), 3);
        service.remove("echo");
        assert!(service.get("echo").is_empty());
    }
}
