//! Scheduler graph vertices

use packwarden_core::{Constraint, Dependency};
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::checker::Checker;

/// Name of the sentinel node every package follows
pub const GLOBAL_NODE: &str = "global";

/// Progress of a node through the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Scheduled,
    Active,
}

/// Whether a node may run, and why not
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl NodeStatus {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn disabled(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            enabled: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// What a package requires before it may be scheduled
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Constraints {
    /// Lower runs first
    pub order: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<Constraint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Constraint>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, Dependency>,
}

/// Anything the scheduler can place in its graph
pub trait Package: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> Option<Version>;
    fn constraints(&self) -> Constraints;
}

/// Plain [`Package`] built from its parts
#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<Version>,
    pub constraints: Constraints,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            version: None,
            constraints: Constraints {
                order,
                ..Default::default()
            },
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_dependency(mut self, name: &str, dependency: Dependency) -> Self {
        self.constraints
            .dependencies
            .insert(name.to_string(), dependency);
        self
    }

    pub fn with_kubernetes(mut self, constraint: Constraint) -> Self {
        self.constraints.kubernetes = Some(constraint);
        self
    }

    pub fn with_platform(mut self, constraint: Constraint) -> Self {
        self.constraints.platform = Some(constraint);
        self
    }
}

impl Package for PackageSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Option<Version> {
        self.version.clone()
    }

    fn constraints(&self) -> Constraints {
        self.constraints.clone()
    }
}

/// A vertex of the dependency graph
#[derive(Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) version: Option<Version>,
    pub(crate) order: u32,
    pub(crate) state: NodeState,
    pub(crate) status: NodeStatus,
    pub(crate) followees: BTreeSet<String>,
    pub(crate) followers: BTreeSet<String>,
    pub(crate) checkers: Vec<Arc<dyn Checker>>,
    /// Set once the checkers ran at least once
    pub(crate) evaluated: bool,
}

impl Node {
    pub(crate) fn global() -> Self {
        Self {
            name: GLOBAL_NODE.to_string(),
            version: None,
            order: 0,
            state: NodeState::Active,
            status: NodeStatus::enabled(),
            followees: BTreeSet::new(),
            followers: BTreeSet::new(),
            checkers: Vec::new(),
            evaluated: true,
        }
    }

    pub(crate) fn new(
        name: &str,
        version: Option<Version>,
        constraints: &Constraints,
        checkers: Vec<Arc<dyn Checker>>,
    ) -> Self {
        let mut followees: BTreeSet<String> = constraints.dependencies.keys().cloned().collect();
        followees.insert(GLOBAL_NODE.to_string());

        Self {
            name: name.to_string(),
            version,
            order: constraints.order,
            state: NodeState::Idle,
            status: NodeStatus::enabled(),
            followees,
            followers: BTreeSet::new(),
            checkers,
            evaluated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status.enabled
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    pub fn followees(&self) -> &BTreeSet<String> {
        &self.followees
    }

    pub fn followers(&self) -> &BTreeSet<String> {
        &self.followers
    }

    pub(crate) fn dump(&self) -> NodeDump {
        NodeDump {
            name: self.name.clone(),
            version: self.version.as_ref().map(|v| v.to_string()),
            order: self.order,
            state: self.state,
            status: self.status.clone(),
            followees: self.followees.iter().cloned().collect(),
            followers: self.followers.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("followees", &self.followees)
            .field("checkers", &self.checkers.len())
            .finish()
    }
}

/// Serializable view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeDump {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub order: u32,
    pub state: NodeState,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub followees: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub followers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_node_follows_global() {
        let spec = PackageSpec::new("b", 500).with_dependency(
            "a",
            Dependency {
                constraint: Constraint::parse(">= 1.0").unwrap(),
                optional: false,
            },
        );
        let node = Node::new(&spec.name, None, &spec.constraints, Vec::new());
        let followees: Vec<_> = node.followees().iter().map(String::as_str).collect();
        assert_eq!(followees, vec!["a", GLOBAL_NODE]);
        assert_eq!(node.state(), NodeState::Idle);
        assert!(!node.evaluated);
    }

    #[test]
    fn test_global_starts_active() {
        let global = Node::global();
        assert!(global.is_active());
        assert!(global.is_enabled());
        assert_eq!(global.order(), 0);
    }
}
