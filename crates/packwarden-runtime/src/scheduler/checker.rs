//! Eligibility checks run against the graph

use packwarden_core::{Constraint, Dependency};
use semver::Version;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::node::{Node, NodeStatus};

/// Returns the current version of something outside the graph
pub type VersionGetter = Arc<dyn Fn() -> std::result::Result<Version, String> + Send + Sync>;

/// Arbitrary gate, e.g. "the cluster is bootstrapped"
pub type ConditionFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// One eligibility rule of a node
pub trait Checker: Send + Sync {
    fn check(&self, nodes: &BTreeMap<String, Node>) -> NodeStatus;
}

/// Run checkers in order, stopping at the first one that disables
pub fn evaluate(checkers: &[Arc<dyn Checker>], nodes: &BTreeMap<String, Node>) -> NodeStatus {
    for checker in checkers {
        let status = checker.check(nodes);
        if !status.enabled {
            return status;
        }
    }
    NodeStatus::enabled()
}

pub struct ConditionChecker {
    condition: ConditionFn,
    reason: String,
    message: String,
}

impl ConditionChecker {
    pub fn new(condition: ConditionFn, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            condition,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn bootstrap(condition: ConditionFn) -> Self {
        Self::new(
            condition,
            "BootstrapNotCompleted",
            "cluster bootstrap is not completed",
        )
    }
}

impl Checker for ConditionChecker {
    fn check(&self, _nodes: &BTreeMap<String, Node>) -> NodeStatus {
        if (self.condition)() {
            NodeStatus::enabled()
        } else {
            NodeStatus::disabled(&self.reason, &self.message)
        }
    }
}

/// Matches an external version against a constraint
pub struct VersionChecker {
    subject: &'static str,
    constraint: Constraint,
    getter: VersionGetter,
}

impl VersionChecker {
    pub fn kubernetes(constraint: Constraint, getter: VersionGetter) -> Self {
        Self {
            subject: "Kubernetes",
            constraint,
            getter,
        }
    }

    pub fn platform(constraint: Constraint, getter: VersionGetter) -> Self {
        Self {
            subject: "Platform",
            constraint,
            getter,
        }
    }
}

impl Checker for VersionChecker {
    fn check(&self, _nodes: &BTreeMap<String, Node>) -> NodeStatus {
        match (self.getter)() {
            Ok(version) if self.constraint.matches(&version) => NodeStatus::enabled(),
            Ok(version) => NodeStatus::disabled(
                format!("{}VersionMismatch", self.subject),
                format!(
                    "{} version {} does not satisfy '{}'",
                    self.subject.to_lowercase(),
                    version,
                    self.constraint
                ),
            ),
            Err(e) => NodeStatus::disabled(
                "VersionUnknown",
                format!("{} version is unknown: {}", self.subject.to_lowercase(), e),
            ),
        }
    }
}

/// Requires dependencies to be enabled and of a matching version
pub struct DependencyChecker {
    dependencies: BTreeMap<String, Dependency>,
}

impl DependencyChecker {
    pub fn new(dependencies: BTreeMap<String, Dependency>) -> Self {
        Self { dependencies }
    }
}

impl Checker for DependencyChecker {
    fn check(&self, nodes: &BTreeMap<String, Node>) -> NodeStatus {
        for (name, dependency) in &self.dependencies {
            let node = nodes.get(name).filter(|n| n.is_enabled());

            let Some(node) = node else {
                if dependency.optional {
                    continue;
                }
                return NodeStatus::disabled(
                    "DependencyNotEnabled",
                    format!("dependency '{}' is not enabled", name),
                );
            };

            // Unversioned packages satisfy any constraint
            if let Some(version) = node.version() {
                if !dependency.constraint.matches(version) {
                    return NodeStatus::disabled(
                        "DependencyVersionMismatch",
                        format!(
                            "dependency '{}' version {} does not satisfy '{}'",
                            name, version, dependency.constraint
                        ),
                    );
                }
            }
        }
        NodeStatus::enabled()
    }
}
