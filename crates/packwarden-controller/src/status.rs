//! Writes runtime package conditions into `Module.status`

use async_trait::async_trait;
use packwarden_runtime::{Condition, ConditionStatus, ConditionType, RuntimeError, StatusSink};
use std::sync::Arc;

use crate::crd::{Module, ModuleCondition};
use crate::error::Result;
use crate::store::ModuleStore;

pub const PHASE_READY: &str = "Ready";
pub const PHASE_ERROR: &str = "Error";

pub struct ModuleStatusSink {
    modules: Arc<dyn ModuleStore<Module>>,
}

impl ModuleStatusSink {
    pub fn new(modules: Arc<dyn ModuleStore<Module>>) -> Self {
        Self { modules }
    }

    async fn write(&self, package: &str, conditions: &[Condition]) -> Result<()> {
        let Some(mut module) = self.modules.get(package).await? else {
            tracing::debug!(package = %package, "no module object, status not written");
            return Ok(());
        };

        let status = module.status.get_or_insert_with(Default::default);
        let before = status.clone();
        for condition in conditions {
            merge(&mut status.conditions, condition);
        }
        status.conditions.sort_by(|a, b| a.condition_type.cmp(&b.condition_type));
        if let Some(ready) = conditions
            .iter()
            .find(|c| c.condition_type == ConditionType::ReadyInRuntime)
        {
            status.phase = match ready.status {
                ConditionStatus::True => PHASE_READY.to_string(),
                _ => PHASE_ERROR.to_string(),
            };
        }

        if *status != before {
            self.modules.update_status(&module).await?;
        }
        Ok(())
    }
}

/// Replace the condition of the same type, keeping its transition time when the status holds
fn merge(conditions: &mut Vec<ModuleCondition>, condition: &Condition) {
    let condition_type = format!("{:?}", condition.condition_type);
    let status = format!("{:?}", condition.status);

    match conditions.iter_mut().find(|c| c.condition_type == condition_type) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(condition.last_transition_time);
            }
            existing.status = status;
            existing.reason = condition.reason.clone();
            existing.message = condition.message.clone();
        }
        None => conditions.push(ModuleCondition {
            condition_type,
            status,
            reason: condition.reason.clone(),
            message: condition.message.clone(),
            last_transition_time: Some(condition.last_transition_time),
        }),
    }
}

#[async_trait]
impl StatusSink for ModuleStatusSink {
    async fn publish(
        &self,
        package: &str,
        conditions: &[Condition],
    ) -> packwarden_runtime::Result<()> {
        self.write(package, conditions)
            .await
            .map_err(|e| RuntimeError::Status(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ModuleSpec;
    use crate::store::MockModuleStore;

    #[tokio::test]
    async fn test_conditions_written_to_module() {
        let store = Arc::new(MockModuleStore::<Module>::new());
        store.insert(Module::new("echo", ModuleSpec::default()));
        let sink = ModuleStatusSink::new(store.clone());

        sink.publish(
            "echo",
            &[
                Condition::ready(ConditionType::ReadyInRuntime),
                Condition::ready(ConditionType::HelmApplied),
            ],
        )
        .await
        .unwrap();

        let status = store.object("echo").unwrap().status.unwrap();
        assert_eq!(status.phase, PHASE_READY);
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0].condition_type, "HelmApplied");

        sink.publish("echo", &[Condition::ready(ConditionType::ReadyInRuntime)])
            .await
            .unwrap();
        assert_eq!(store.status_update_count(), 1);

        sink.publish(
            "echo",
            &[Condition::failed(ConditionType::ReadyInRuntime, "HooksFailed", "exit 1")],
        )
        .await
        .unwrap();
        let status = store.object("echo").unwrap().status.unwrap();
        assert_eq!(status.phase, PHASE_ERROR);
        let ready = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "ReadyInRuntime")
            .unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "HooksFailed");
        assert_eq!(store.status_update_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_module_ignored() {
        let store = Arc::new(MockModuleStore::<Module>::new());
        let sink = ModuleStatusSink::new(store.clone());
        sink.publish("global", &[Condition::ready(ConditionType::ReadyInRuntime)])
            .await
            .unwrap();
        assert_eq!(store.status_update_count(), 0);
    }
}
