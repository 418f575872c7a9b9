use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::node::Node;

/// Order nodes so that every node comes after its followees.
///
/// Ties are broken by `(order, name)`. Nodes on a cycle never reach zero
/// in-degree and are left out.
pub(crate) fn sort(nodes: &BTreeMap<String, Node>) -> Vec<String> {
    let mut in_degrees: HashMap<&str, usize> = nodes
        .values()
        .map(|node| {
            let degree = node
                .followees
                .iter()
                .filter(|f| nodes.contains_key(f.as_str()))
                .count();
            (node.name.as_str(), degree)
        })
        .collect();

    let mut ready: BTreeSet<(u32, &str)> = in_degrees
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| (nodes[*name].order, *name))
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some((_, name)) = ready.pop_first() {
        sorted.push(name.to_string());

        for follower in &nodes[name].followers {
            if let Some(degree) = in_degrees.get_mut(follower.as_str()) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert((nodes[follower.as_str()].order, follower.as_str()));
                }
            }
        }
    }

    if sorted.len() < nodes.len() {
        let skipped: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|name| !sorted.iter().any(|s| s == name))
            .collect();
        tracing::warn!(nodes = ?skipped, "dependency cycle, nodes skipped");
    }

    sorted
}
