//! Per-hook binding controller
//!
//! Connects a hook's Kubernetes bindings to monitors of the shared events
//! manager and its schedule bindings to the shared schedule manager, and
//! turns incoming events into [`BindingExecutionInfo`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::binding_context::{
    BindingContext, BindingContextMetadata, BindingExecutionInfo, ContextType,
    ObjectAndFilterResult, Snapshots,
};
use super::config::{BindingType, KubernetesConfig, ScheduleConfig};
use super::Hook;
use crate::error::Result;
use crate::events::{KubeEvent, KubeEventsManager, MonitorConfig};
use crate::schedule::ScheduleManager;

struct KubeBinding {
    config: KubernetesConfig,
    monitor_id: String,
}

/// Controller of one hook's event bindings
pub struct HookController {
    hook: String,
    kube_bindings: Vec<KubeBinding>,
    schedule_bindings: Vec<ScheduleConfig>,
    events: Arc<dyn KubeEventsManager>,
    schedules: Arc<ScheduleManager>,
}

impl HookController {
    pub fn new(
        hook: &Hook,
        events: Arc<dyn KubeEventsManager>,
        schedules: Arc<ScheduleManager>,
    ) -> Self {
        let kube_bindings = hook
            .config
            .kubernetes
            .iter()
            .enumerate()
            .map(|(i, config)| KubeBinding {
                monitor_id: format!("{}/{}/{}", hook.name, config.name, i),
                config: config.clone(),
            })
            .collect();

        Self {
            hook: hook.name.clone(),
            kube_bindings,
            schedule_bindings: hook.config.schedule.clone(),
            events,
            schedules,
        }
    }

    pub fn hook_name(&self) -> &str {
        &self.hook
    }

    pub fn monitor_ids(&self) -> Vec<String> {
        self.kube_bindings
            .iter()
            .map(|b| b.monitor_id.clone())
            .collect()
    }

    /// Start monitors and build the initial synchronization runs.
    ///
    /// A binding that does not run on synchronization, or does not wait for
    /// it, is unlocked right away. Otherwise the returned info carries the
    /// monitor to unlock once its run has completed.
    pub async fn enable_kubernetes_bindings(&self) -> Result<Vec<BindingExecutionInfo>> {
        let mut infos = Vec::new();

        for binding in &self.kube_bindings {
            let monitor = MonitorConfig::from_binding(&binding.monitor_id, &binding.config)?;
            let objects = self.events.add_monitor(monitor).await?;

            if !binding.config.execute_hook_on_synchronization {
                self.events.unlock_monitor(&binding.monitor_id);
                continue;
            }

            let wait = binding.config.wait_for_synchronization;
            if !wait {
                self.events.unlock_monitor(&binding.monitor_id);
            }

            let context = BindingContext {
                binding: binding.config.name.clone(),
                context_type: Some(ContextType::Synchronization),
                objects: objects.into_iter().map(ObjectAndFilterResult::from).collect(),
                metadata: self.metadata_for(
                    BindingType::OnKubernetesEvent,
                    &binding.config.include_snapshots_from,
                    Some(&binding.monitor_id),
                ),
                ..Default::default()
            };

            infos.push(BindingExecutionInfo {
                binding: binding.config.name.clone(),
                binding_type: BindingType::OnKubernetesEvent,
                contexts: vec![context],
                queue: binding.config.queue.clone(),
                allow_failure: binding.config.allow_failure,
                is_synchronization: true,
                unlock_monitors: if wait {
                    vec![binding.monitor_id.clone()]
                } else {
                    Vec::new()
                },
            });
        }

        Ok(infos)
    }

    pub fn enable_schedule_bindings(&self) -> Result<()> {
        for binding in &self.schedule_bindings {
            self.schedules.add(&binding.crontab)?;
        }
        Ok(())
    }

    pub fn disable_schedule_bindings(&self) {
        for binding in &self.schedule_bindings {
            self.schedules.remove(&binding.crontab);
        }
    }

    pub fn stop_monitors(&self) {
        for binding in &self.kube_bindings {
            self.events.stop_monitor(&binding.monitor_id);
        }
    }

    pub fn unlock_kubernetes_events_for(&self, monitor_id: &str) {
        if self.kube_bindings.iter().any(|b| b.monitor_id == monitor_id) {
            self.events.unlock_monitor(monitor_id);
        }
    }

    /// Build a run for a Kubernetes event, if it belongs to this hook and
    /// the binding reacts to its type
    pub fn handle_kube_event(&self, event: &KubeEvent) -> Option<BindingExecutionInfo> {
        let binding = self
            .kube_bindings
            .iter()
            .find(|b| b.monitor_id == event.monitor_id)?;

        if !binding.config.reacts_to(event.watch_event) {
            return None;
        }

        let mut context = BindingContext {
            binding: binding.config.name.clone(),
            context_type: Some(ContextType::Event),
            watch_event: Some(event.watch_event),
            object: Some(event.object.clone()),
            metadata: self.metadata_for(
                BindingType::OnKubernetesEvent,
                &binding.config.include_snapshots_from,
                Some(&binding.monitor_id),
            ),
            ..Default::default()
        };
        context.snapshots = self.snapshots_for(&context.metadata);

        Some(BindingExecutionInfo {
            binding: binding.config.name.clone(),
            binding_type: BindingType::OnKubernetesEvent,
            contexts: vec![context],
            queue: binding.config.queue.clone(),
            allow_failure: binding.config.allow_failure,
            is_synchronization: false,
            unlock_monitors: Vec::new(),
        })
    }

    /// Build runs for every schedule binding with this crontab
    pub fn handle_schedule_event(&self, crontab: &str) -> Vec<BindingExecutionInfo> {
        self.schedule_bindings
            .iter()
            .filter(|b| b.crontab == crontab)
            .map(|binding| {
                let mut context = BindingContext {
                    binding: binding.name.clone(),
                    context_type: Some(ContextType::Schedule),
                    metadata: self.metadata_for(
                        BindingType::Schedule,
                        &binding.include_snapshots_from,
                        None,
                    ),
                    ..Default::default()
                };
                context.snapshots = self.snapshots_for(&context.metadata);

                BindingExecutionInfo {
                    binding: binding.name.clone(),
                    binding_type: BindingType::Schedule,
                    contexts: vec![context],
                    queue: binding.queue.clone(),
                    allow_failure: binding.allow_failure,
                    is_synchronization: false,
                    unlock_monitors: Vec::new(),
                }
            })
            .collect()
    }

    /// Refresh snapshots of contexts right before the hook runs
    pub fn update_snapshots(&self, contexts: Vec<BindingContext>) -> Vec<BindingContext> {
        contexts
            .into_iter()
            .map(|mut ctx| {
                let snapshots = self.snapshots_for(&ctx.metadata);
                if !snapshots.is_empty() || ctx.metadata.include_all_snapshots {
                    ctx.snapshots = snapshots;
                }
                ctx
            })
            .collect()
    }

    /// Current objects of every Kubernetes binding
    pub fn kubernetes_snapshots(&self) -> Snapshots {
        self.kube_bindings
            .iter()
            .map(|b| (b.config.name.clone(), self.objects_of(&b.monitor_id)))
            .collect()
    }

    fn objects_of(&self, monitor_id: &str) -> Vec<ObjectAndFilterResult> {
        self.events
            .snapshot(monitor_id)
            .into_iter()
            .map(ObjectAndFilterResult::from)
            .collect()
    }

    fn snapshots_for(&self, metadata: &BindingContextMetadata) -> Snapshots {
        if metadata.include_all_snapshots {
            return self.kubernetes_snapshots();
        }

        let mut snapshots = BTreeMap::new();
        for name in &metadata.include_snapshots_from {
            if let Some(binding) = self.kube_bindings.iter().find(|b| &b.config.name == name) {
                snapshots.insert(name.clone(), self.objects_of(&binding.monitor_id));
            }
        }
        snapshots
    }

    fn metadata_for(
        &self,
        binding_type: BindingType,
        include: &[String],
        monitor_id: Option<&str>,
    ) -> BindingContextMetadata {
        BindingContextMetadata {
            binding_type: Some(binding_type),
            include_snapshots_from: include.to_vec(),
            include_all_snapshots: false,
            monitor_id: monitor_id.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockKubeEventsManager;
    use crate::hooks::{HookConfig, WatchEventType};
    use serde_json::json;

    const CONFIG: &str = r#"
schedule:
  - name: sweep
    crontab: "*/5 * * * *"
    queue: sweeper
    includeSnapshotsFrom: [pods]
kubernetes:
  - name: pods
    kind: Pod
    executeHookOnEvent: [Added]
  - name: secrets
    kind: Secret
    waitForSynchronization: false
  - name: nodes
    kind: Node
    executeHookOnSynchronization: false
"#;

    fn pod(name: &str) -> serde_json::Value {
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": "ns"}})
    }

    fn controller(events: Arc<MockKubeEventsManager>) -> HookController {
        let hook = Hook::new("echo/hooks/watch", "/x", HookConfig::parse("watch", CONFIG).unwrap());
        HookController::new(&hook, events, Arc::new(ScheduleManager::new()))
    }

    #[tokio::test]
    async fn test_enable_kubernetes_bindings() {
        let events = Arc::new(MockKubeEventsManager::new().with_object(pod("a")));
        let ctrl = controller(events.clone());

        let infos = ctrl.enable_kubernetes_bindings().await.unwrap();
        assert_eq!(infos.len(), 2);

        let pods = &infos[0];
        assert!(pods.is_synchronization);
        assert_eq!(pods.queue, "main");
        assert_eq!(pods.contexts[0].objects.len(), 1);
        assert_eq!(pods.unlock_monitors, vec!["echo/hooks/watch/pods/0".to_string()]);
        assert!(events.is_locked("echo/hooks/watch/pods/0"));

        // Not waiting for synchronization, or not running on it: unlocked
        assert!(infos[1].unlock_monitors.is_empty());
        assert!(!events.is_locked("echo/hooks/watch/secrets/1"));
        assert!(!events.is_locked("echo/hooks/watch/nodes/2"));
    }

    #[tokio::test]
    async fn test_handle_kube_event_filters_types() {
        let events = Arc::new(MockKubeEventsManager::new());
        let ctrl = controller(events.clone());
        ctrl.enable_kubernetes_bindings().await.unwrap();

        let added = KubeEvent {
            monitor_id: "echo/hooks/watch/pods/0".to_string(),
            watch_event: WatchEventType::Added,
            object: pod("a"),
        };
        let info = ctrl.handle_kube_event(&added).unwrap();
        assert_eq!(info.contexts[0].context_type, Some(ContextType::Event));
        assert_eq!(info.contexts[0].object, Some(pod("a")));

        let deleted = KubeEvent {
            watch_event: WatchEventType::Deleted,
            ..added.clone()
        };
        assert!(ctrl.handle_kube_event(&deleted).is_none());

        let foreign = KubeEvent {
            monitor_id: "other/hook/pods/0".to_string(),
            ..added
        };
        assert!(ctrl.handle_kube_event(&foreign).is_none());
    }

    #[tokio::test]
    async fn test_schedule_event_includes_snapshots() {
        let events = Arc::new(MockKubeEventsManager::new().with_object(pod("a")));
        let ctrl = controller(events);
        ctrl.enable_kubernetes_bindings().await.unwrap();
        ctrl.enable_schedule_bindings().unwrap();

        let infos = ctrl.handle_schedule_event("*/5 * * * *");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].queue, "sweeper");
        assert_eq!(infos[0].contexts[0].snapshots["pods"].len(), 1);
        assert!(!infos[0].contexts[0].snapshots.contains_key("secrets"));

        assert!(ctrl.handle_schedule_event("0 * * * *").is_empty());
    }

    #[tokio::test]
    async fn test_update_snapshots_for_helm_phases() {
        let events = Arc::new(MockKubeEventsManager::new().with_object(pod("a")));
        let ctrl = controller(events.clone());
        ctrl.enable_kubernetes_bindings().await.unwrap();

        events.emit(WatchEventType::Added, pod("b"));

        let contexts = ctrl.update_snapshots(vec![BindingContext::for_binding(BindingType::BeforeHelm)]);
        let snapshots = &contexts[0].snapshots;
        assert_eq!(snapshots["pods"].len(), 2);
        assert!(snapshots.contains_key("secrets"));
        assert!(snapshots.contains_key("nodes"));
    }

    #[tokio::test]
    async fn test_stop_monitors() {
        let events = Arc::new(MockKubeEventsManager::new());
        let ctrl = controller(events.clone());
        ctrl.enable_kubernetes_bindings().await.unwrap();

        ctrl.stop_monitors();
        for id in ctrl.monitor_ids() {
            assert!(!events.has_monitor(&id));
        }
    }
}
