// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Arena-backed resolution graph.
//!
//! Nodes are stored in a single vector and refer to each other through
//! [`NodeId`] indices. The resolver pushes a node only after all of its
//! dependencies, so arena order is always a valid topological order.

use std::collections::{HashMap, HashSet};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./graph_test.rs"]
mod graph_test;

/// Resolved package identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIdent {
    pub name: String,
    pub version: Version,
}

impl PackageIdent {
    pub fn new<S: Into<String>>(name: S, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PackageIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Stable index of a node within its [`ResolutionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A resolved package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNode {
    pub ident: PackageIdent,
    /// Dependencies in declaration order.
    pub dependencies: Vec<NodeId>,
    /// Hash of the build inputs and the dependencies' descriptors.
    ///
    /// This is also the node's store address.
    pub descriptor: Digest,
}

impl PackageNode {
    pub fn address(&self) -> Digest {
        self.descriptor
    }
}

/// Acyclic set of resolved packages, rooted at the requests.
#[derive(Debug, Clone, Default)]
pub struct ResolutionGraph {
    nodes: Vec<PackageNode>,
    roots: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
}

impl ResolutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node whose dependencies are already in the graph.
    pub(crate) fn push(&mut self, node: PackageNode) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        if let Some(dep) = node.dependencies.iter().find(|d| d.0 >= id.0) {
            return Err(Error::InvalidGraph(format!(
                "{} refers to node {} which is not yet in the graph",
                node.ident, dep.0
            )));
        }
        if self.by_name.contains_key(&node.ident.name) {
            return Err(Error::InvalidGraph(format!(
                "more than one node resolved for '{}'",
                node.ident.name
            )));
        }
        self.by_name.insert(node.ident.name.clone(), id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Record a root request's node. Roots keep declaration order and are
    /// not duplicated.
    pub(crate) fn add_root(&mut self, id: NodeId) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn node(&self, id: NodeId) -> &PackageNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&PackageNode> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids with dependencies before dependents.
    pub fn topological_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PackageNode)> + '_ {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Reverse edges: for each node, the nodes that depend on it.
    pub fn dependents(&self) -> Vec<Vec<NodeId>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (id, node) in self.iter() {
            for dep in &node.dependencies {
                dependents[dep.0].push(id);
            }
        }
        dependents
    }

    /// Check the closure invariants.
    ///
    /// Every dependency reference resolves inside the graph, each node lists a
    /// dependency at most once, every node is reachable from a root and names
    /// are unique.
    pub fn validate(&self) -> Result<()> {
        for (id, node) in self.iter() {
            let mut seen = HashSet::new();
            for dep in &node.dependencies {
                if dep.0 >= id.0 {
                    return Err(Error::InvalidGraph(format!(
                        "{} has a dangling or forward dependency reference",
                        node.ident
                    )));
                }
                if !seen.insert(*dep) {
                    return Err(Error::InvalidGraph(format!(
                        "{} lists {} more than once",
                        node.ident,
                        self.nodes[dep.0].ident
                    )));
                }
            }
            if self.by_name.get(&node.ident.name) != Some(&id) {
                return Err(Error::InvalidGraph(format!(
                    "name index is inconsistent for {}",
                    node.ident
                )));
            }
        }

        let mut reachable = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            let Some(flag) = reachable.get_mut(id.0) else {
                return Err(Error::InvalidGraph(format!("root {} is dangling", id.0)));
            };
            if std::mem::replace(flag, true) {
                continue;
            }
            stack.extend(self.nodes[id.0].dependencies.iter().copied());
        }
        if let Some(idx) = reachable.iter().position(|r| !r) {
            return Err(Error::InvalidGraph(format!(
                "{} is not reachable from any root",
                self.nodes[idx].ident
            )));
        }
        Ok(())
    }
}
