//! Dependency scheduler
//!
//! Packages are vertices of a graph whose edges are their dependencies. Every
//! pass re-evaluates which packages are enabled, in dependency order, and then
//! schedules the idle ones that are allowed to start:
//!
//! - every followee is active
//! - every enabled package with a strictly lower order is active
//!
//! When an enabled bit flips, the whole graph, `global` included, goes back
//! to idle and the pass repeats until it is stable.
//!
//! Callbacks fire after the internal lock is released, so they may call back
//! into the scheduler.

mod checker;
mod node;
mod topo;

pub use checker::{
    Checker, ConditionChecker, ConditionFn, DependencyChecker, VersionChecker, VersionGetter,
    evaluate,
};
pub use node::{
    Constraints, GLOBAL_NODE, Node, NodeDump, NodeState, NodeStatus, Package, PackageSpec,
};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;

pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type GlobalDoneCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Sources of the environment checks
#[derive(Clone, Default)]
pub struct SchedulerConfig {
    kubernetes_version: Option<VersionGetter>,
    platform_version: Option<VersionGetter>,
    bootstrap: Option<ConditionFn>,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kubernetes_version(mut self, getter: VersionGetter) -> Self {
        self.kubernetes_version = Some(getter);
        self
    }

    pub fn platform_version(mut self, getter: VersionGetter) -> Self {
        self.platform_version = Some(getter);
        self
    }

    pub fn bootstrap(mut self, condition: ConditionFn) -> Self {
        self.bootstrap = Some(condition);
        self
    }

    /// Checkers for a set of constraints, in evaluation order
    fn checkers(&self, constraints: &Constraints) -> Vec<Arc<dyn Checker>> {
        let mut checkers: Vec<Arc<dyn Checker>> = Vec::new();

        if let Some(condition) = &self.bootstrap {
            checkers.push(Arc::new(ConditionChecker::bootstrap(condition.clone())));
        }

        if let Some(constraint) = &constraints.kubernetes {
            let getter = self
                .kubernetes_version
                .clone()
                .unwrap_or_else(|| Arc::new(|| Err("no kubernetes version source".to_string())));
            checkers.push(Arc::new(VersionChecker::kubernetes(constraint.clone(), getter)));
        }

        if let Some(constraint) = &constraints.platform {
            let getter = self
                .platform_version
                .clone()
                .unwrap_or_else(|| Arc::new(|| Err("no platform version source".to_string())));
            checkers.push(Arc::new(VersionChecker::platform(constraint.clone(), getter)));
        }

        if !constraints.dependencies.is_empty() {
            checkers.push(Arc::new(DependencyChecker::new(constraints.dependencies.clone())));
        }

        checkers
    }
}

enum Event {
    Schedule(String),
    Disable(String),
    GlobalDone(Vec<String>),
}

struct Graph {
    nodes: BTreeMap<String, Node>,
    paused: bool,
}

impl Graph {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(GLOBAL_NODE.to_string(), Node::global());
        Self {
            nodes,
            paused: false,
        }
    }

    fn rebuild_followers(&mut self) {
        let edges: Vec<(String, String)> = self
            .nodes
            .values()
            .flat_map(|n| n.followees.iter().map(move |f| (f.clone(), n.name.clone())))
            .collect();

        for node in self.nodes.values_mut() {
            node.followers.clear();
        }
        for (followee, follower) in edges {
            if let Some(node) = self.nodes.get_mut(&followee) {
                node.followers.insert(follower);
            }
        }
    }

    fn reset(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.state = NodeState::Idle;
        }
    }

    /// The node and everything that transitively follows it
    fn with_followers(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.followers.iter().cloned());
            }
        }
        seen
    }

    fn can_schedule(&self, node: &Node) -> bool {
        if !node.is_enabled() || node.state != NodeState::Idle {
            return false;
        }

        let followees_active = node
            .followees
            .iter()
            .filter_map(|f| self.nodes.get(f))
            .filter(|f| f.is_enabled())
            .all(Node::is_active);

        let lower_active = self
            .nodes
            .values()
            .filter(|other| other.name != node.name && other.order < node.order)
            .filter(|other| other.is_enabled())
            .all(Node::is_active);

        followees_active && lower_active
    }

    fn pass(&mut self, events: &mut Vec<Event>) {
        if self.paused {
            return;
        }

        let order = loop {
            let order = topo::sort(&self.nodes);
            let mut changed = false;

            for name in &order {
                if name == GLOBAL_NODE {
                    continue;
                }
                let Some(checkers) = self.nodes.get(name).map(|n| n.checkers.clone()) else {
                    continue;
                };
                let status = evaluate(&checkers, &self.nodes);

                let Some(node) = self.nodes.get_mut(name) else {
                    continue;
                };
                if node.evaluated && node.status.enabled != status.enabled {
                    changed = true;
                    if node.status.enabled {
                        tracing::info!(package = %name, reason = %status.reason, "package disabled");
                        events.push(Event::Disable(name.clone()));
                    } else {
                        tracing::info!(package = %name, "package enabled");
                    }
                }
                node.evaluated = true;
                node.status = status;
            }

            if !changed {
                break order;
            }

            for node in self.nodes.values_mut() {
                node.state = NodeState::Idle;
            }
        };

        for name in &order {
            let schedulable = self
                .nodes
                .get(name)
                .is_some_and(|node| self.can_schedule(node));
            if !schedulable {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(name) {
                node.state = NodeState::Scheduled;
                tracing::debug!(package = %name, "package scheduled");
                events.push(Event::Schedule(name.clone()));
            }
        }
    }
}

/// Decides which packages may run and when
pub struct Scheduler {
    config: SchedulerConfig,
    graph: Mutex<Graph>,
    on_schedule: RwLock<Option<NameCallback>>,
    on_disable: RwLock<Option<NameCallback>>,
    on_global_done: RwLock<Option<GlobalDoneCallback>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            graph: Mutex::new(Graph::new()),
            on_schedule: RwLock::new(None),
            on_disable: RwLock::new(None),
            on_global_done: RwLock::new(None),
        }
    }

    pub fn on_schedule(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_schedule.write() = Some(Arc::new(callback));
    }

    pub fn on_disable(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_disable.write() = Some(Arc::new(callback));
    }

    pub fn on_global_done(&self, callback: impl Fn(Vec<String>) + Send + Sync + 'static) {
        *self.on_global_done.write() = Some(Arc::new(callback));
    }

    /// Add packages in bulk, then run a single pass
    pub fn initialize(&self, packages: &[&dyn Package]) {
        self.update(|graph, events| {
            for package in packages {
                Self::insert(&self.config, graph, *package);
            }
            graph.rebuild_followers();
            graph.pass(events);
        });
    }

    /// Add or replace a package
    pub fn add_node(&self, package: &dyn Package) {
        self.update(|graph, events| {
            Self::insert(&self.config, graph, package);
            graph.rebuild_followers();
            graph.pass(events);
        });
    }

    pub fn remove_node(&self, name: &str) {
        if name == GLOBAL_NODE {
            return;
        }
        self.update(|graph, events| {
            if graph.nodes.remove(name).is_some() {
                tracing::debug!(package = %name, "node removed");
                graph.rebuild_followers();
                graph.pass(events);
            }
        });
    }

    /// Mark a scheduled node done and schedule what it unblocks.
    /// Completing an active node does nothing.
    pub fn complete(&self, name: &str) {
        self.update(|graph, events| {
            let Some(node) = graph.nodes.get_mut(name) else {
                return;
            };
            if node.state == NodeState::Active {
                return;
            }
            node.state = NodeState::Active;
            tracing::debug!(package = %name, "node completed");

            if name == GLOBAL_NODE {
                let enabled = graph
                    .nodes
                    .values()
                    .filter(|n| n.name != GLOBAL_NODE && n.is_enabled())
                    .map(|n| n.name.clone())
                    .collect();
                events.push(Event::GlobalDone(enabled));
            }
            graph.pass(events);
        });
    }

    /// Run a node again
    pub fn trigger(&self, name: &str) {
        self.update(|graph, events| {
            graph.reset(name);
            graph.pass(events);
        });
    }

    /// Run a node and everything that depends on it again
    pub fn reschedule(&self, name: &str) {
        self.update(|graph, events| {
            for affected in graph.with_followers(name) {
                graph.reset(&affected);
            }
            graph.pass(events);
        });
    }

    /// Re-evaluate the graph
    pub fn schedule(&self) {
        self.update(|graph, events| graph.pass(events));
    }

    pub fn pause(&self) {
        self.graph.lock().paused = true;
    }

    pub fn resume(&self) {
        self.update(|graph, events| {
            graph.paused = false;
            graph.pass(events);
        });
    }

    /// Evaluate constraints against the current graph without changing it
    pub fn check_by_constraints(&self, constraints: &Constraints) -> NodeStatus {
        let checkers = self.config.checkers(constraints);
        let graph = self.graph.lock();
        evaluate(&checkers, &graph.nodes)
    }

    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.graph.lock().nodes.get(name).map(|n| n.state)
    }

    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.graph.lock().nodes.get(name).map(|n| n.status.clone())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.graph
            .lock()
            .nodes
            .get(name)
            .is_some_and(|n| n.is_enabled())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.lock().nodes.contains_key(name)
    }

    pub fn nodes(&self) -> Vec<NodeDump> {
        self.graph.lock().nodes.values().map(Node::dump).collect()
    }

    /// YAML snapshot of the graph
    pub fn dump(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.nodes())?)
    }

    fn insert(config: &SchedulerConfig, graph: &mut Graph, package: &dyn Package) {
        let name = package.name();
        if name == GLOBAL_NODE {
            tracing::warn!("package name '{}' is reserved", GLOBAL_NODE);
            return;
        }

        let constraints = package.constraints();
        let checkers = config.checkers(&constraints);
        let node = Node::new(name, package.version(), &constraints, checkers);
        if graph.nodes.insert(name.to_string(), node).is_some() {
            tracing::debug!(package = %name, "node replaced");
        }
    }

    fn update(&self, f: impl FnOnce(&mut Graph, &mut Vec<Event>)) {
        let mut events = Vec::new();
        {
            let mut graph = self.graph.lock();
            f(&mut graph, &mut events);
        }
        self.emit(events);
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Schedule(name) => {
                    let callback = self.on_schedule.read().clone();
                    if let Some(callback) = callback {
                        callback(&name);
                    }
                }
                Event::Disable(name) => {
                    let callback = self.on_disable.read().clone();
                    if let Some(callback) = callback {
                        callback(&name);
                    }
                }
                Event::GlobalDone(enabled) => {
                    let callback = self.on_global_done.read().clone();
                    if let Some(callback) = callback {
                        callback(enabled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packwarden_core::{Constraint, Dependency};
    use semver::Version;

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn attach(self: &Arc<Self>, scheduler: &Scheduler) {
            let rec = self.clone();
            scheduler.on_schedule(move |name| rec.events.lock().push(format!("schedule:{}", name)));
            let rec = self.clone();
            scheduler.on_disable(move |name| rec.events.lock().push(format!("disable:{}", name)));
            let rec = self.clone();
            scheduler.on_global_done(move |names| {
                rec.events.lock().push(format!("global:{}", names.join(",")))
            });
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    fn depends(constraint: &str, optional: bool) -> Dependency {
        Dependency {
            constraint: Constraint::parse(constraint).unwrap(),
            optional,
        }
    }

    #[test]
    fn test_lower_order_runs_first() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        let a = PackageSpec::new("a", 100);
        let b = PackageSpec::new("b", 200);
        scheduler.initialize(&[&a, &b]);
        assert_eq!(recorder.take(), vec!["schedule:a"]);

        // scheduled is not active
        scheduler.schedule();
        assert!(recorder.take().is_empty());

        scheduler.complete("a");
        assert_eq!(recorder.take(), vec!["schedule:b"]);
        scheduler.complete("b");
        assert_eq!(scheduler.state("b"), Some(NodeState::Active));
    }

    #[test]
    fn test_optional_dependency_absent_keeps_enabled() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let b = PackageSpec::new("b", 500).with_dependency("missing", depends(">= 1.0", true));
        scheduler.add_node(&b);
        assert!(scheduler.is_enabled("b"));
    }

    #[test]
    fn test_bootstrap_gate_wins_over_dependencies() {
        let config = SchedulerConfig::new().bootstrap(Arc::new(|| false));
        let scheduler = Scheduler::new(config);

        let a = PackageSpec::new("a", 100).with_version(Version::new(1, 0, 0));
        let b = PackageSpec::new("b", 500).with_dependency("a", depends(">= 1.0", false));
        scheduler.initialize(&[&a, &b]);

        let status = scheduler.status("b").unwrap();
        assert!(!status.enabled);
        assert_eq!(status.reason, "BootstrapNotCompleted");
    }

    #[test]
    fn test_disabled_lower_order_does_not_block() {
        let config = SchedulerConfig::new().kubernetes_version(Arc::new(|| Ok(Version::new(1, 28, 0))));
        let scheduler = Scheduler::new(config);
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        let old = PackageSpec::new("old", 100).with_kubernetes(Constraint::parse(">= 1.30").unwrap());
        let app = PackageSpec::new("app", 500);
        scheduler.initialize(&[&old, &app]);

        assert_eq!(recorder.take(), vec!["schedule:app"]);
        assert_eq!(
            scheduler.status("old").unwrap().reason,
            "KubernetesVersionMismatch"
        );
    }

    #[test]
    fn test_reschedule_resets_followers() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        let a = PackageSpec::new("a", 100);
        let b = PackageSpec::new("b", 500).with_dependency("a", depends("*", false));
        let c = PackageSpec::new("c", 100);
        scheduler.initialize(&[&a, &b, &c]);
        scheduler.complete("a");
        scheduler.complete("c");
        scheduler.complete("b");
        recorder.take();

        scheduler.reschedule("a");
        assert_eq!(recorder.take(), vec!["schedule:a"]);
        assert_eq!(scheduler.state("b"), Some(NodeState::Idle));
        assert_eq!(scheduler.state("c"), Some(NodeState::Active));

        scheduler.complete("a");
        assert_eq!(recorder.take(), vec!["schedule:b"]);
    }

    #[test]
    fn test_global_done_reports_enabled() {
        let config = SchedulerConfig::new().bootstrap(Arc::new(|| true));
        let scheduler = Scheduler::new(config);
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        let a = PackageSpec::new("a", 100);
        let b = PackageSpec::new("b", 200).with_dependency("missing", depends("*", false));
        scheduler.initialize(&[&a, &b]);
        recorder.take();

        scheduler.trigger(GLOBAL_NODE);
        assert_eq!(recorder.take(), vec!["schedule:global"]);

        scheduler.complete(GLOBAL_NODE);
        let events = recorder.take();
        assert_eq!(events[0], "global:a");
    }

    #[test]
    fn test_complete_of_active_node_is_noop() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        let a = PackageSpec::new("a", 100);
        scheduler.initialize(&[&a]);
        scheduler.complete("a");
        recorder.take();

        scheduler.complete(GLOBAL_NODE);
        scheduler.complete("a");
        assert!(recorder.take().is_empty());
        assert_eq!(scheduler.state("a"), Some(NodeState::Active));
    }

    #[test]
    fn test_pause_suppresses_callbacks() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        scheduler.pause();
        scheduler.add_node(&PackageSpec::new("a", 100));
        assert!(recorder.take().is_empty());

        scheduler.resume();
        assert_eq!(recorder.take(), vec!["schedule:a"]);
    }

    #[test]
    fn test_remove_node_unblocks() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        let recorder = Arc::new(Recorder::default());
        recorder.attach(&scheduler);

        scheduler.initialize(&[&PackageSpec::new("a", 100), &PackageSpec::new("b", 200)]);
        recorder.take();

        scheduler.remove_node("a");
        assert_eq!(recorder.take(), vec!["schedule:b"]);
        assert!(!scheduler.contains("a"));

        scheduler.remove_node(GLOBAL_NODE);
        assert!(scheduler.contains(GLOBAL_NODE));
    }

    #[test]
    fn test_check_by_constraints() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        scheduler.add_node(&PackageSpec::new("a", 100).with_version(Version::new(1, 4, 0)));

        let constraints = Constraints {
            order: 300,
            dependencies: BTreeMap::from([("a".to_string(), depends(">= 2.0", false))]),
            ..Default::default()
        };
        let status = scheduler.check_by_constraints(&constraints);
        assert_eq!(status.reason, "DependencyVersionMismatch");
        assert_eq!(scheduler.nodes().len(), 2);
    }

    #[test]
    fn test_dump() {
        let scheduler = Scheduler::new(SchedulerConfig::new());
        scheduler.add_node(&PackageSpec::new("echo", 100).with_version(Version::new(0, 1, 0)));

        let dump = scheduler.dump().unwrap();
        assert!(dump.contains("name: global"));
        assert!(dump.contains("name: echo"));
        assert!(dump.contains("state: scheduled"));
        assert!(dump.contains("0.1.0"));
    }
}
