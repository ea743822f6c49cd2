// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Composition of realized store entries into an environment.

use std::collections::{HashMap, HashSet};

use crate::digest::Digest;
use crate::environment::{DEFAULT_SEPARATOR, EnvironmentDescriptor};
use crate::graph::{NodeId, ResolutionGraph};
use crate::store::StoreEntry;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./compose_test.rs"]
mod compose_test;

/// Variable listing every contributing store path.
pub const STORE_PATHS_VAR: &str = "ENVFORGE_STORE_PATHS";

/// Maps a directory inside store entries onto a search path variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPathRule {
    pub variable: String,
    /// Directory relative to the entry root, e.g. `lib/pkgconfig`.
    pub subdir: String,
}

impl SearchPathRule {
    pub fn new<V: Into<String>, S: Into<String>>(variable: V, subdir: S) -> Self {
        Self {
            variable: variable.into(),
            subdir: subdir.into(),
        }
    }
}

/// The conventional layout: executables, libraries, pkg-config files,
/// manual pages and shared data.
pub fn default_rules() -> Vec<SearchPathRule> {
    vec![
        SearchPathRule::new("PATH", "bin"),
        SearchPathRule::new("LD_LIBRARY_PATH", "lib"),
        SearchPathRule::new("PKG_CONFIG_PATH", "lib/pkgconfig"),
        SearchPathRule::new("MANPATH", "share/man"),
        SearchPathRule::new("XDG_DATA_DIRS", "share"),
    ]
}

/// Builds environment descriptors from a realized graph.
#[derive(Debug, Clone)]
pub struct Composer {
    rules: Vec<SearchPathRule>,
}

impl Default for Composer {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<SearchPathRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SearchPathRule] {
        &self.rules
    }

    /// Compose the environment of `graph` from its realized `entries`.
    ///
    /// Roots are walked in declaration order, each package before its
    /// dependencies. A store path appears at most once per variable, at
    /// its first occurrence, so the result depends only on the graph and
    /// never on the order in which entries were realized.
    #[tracing::instrument(skip_all, fields(nodes = graph.len()))]
    pub fn compose(
        &self,
        graph: &ResolutionGraph,
        entries: &HashMap<NodeId, StoreEntry>,
    ) -> Result<EnvironmentDescriptor> {
        for (id, node) in graph.iter() {
            if !entries.contains_key(&id) {
                return Err(Error::IncompleteRealization {
                    node: node.ident.clone(),
                });
            }
        }

        let mut order = Vec::with_capacity(graph.len());
        let mut visited = HashSet::new();
        for root in graph.roots() {
            preorder(graph, *root, &mut visited, &mut order);
        }

        let mut env = EnvironmentDescriptor::new();
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut store_paths = Vec::new();
        for id in order {
            let Some(entry) = entries.get(&id) else {
                continue;
            };
            if !seen.insert(entry.address) {
                continue;
            }
            env.contributors.push(entry.address);
            store_paths.push(entry.path.display().to_string());

            for rule in &self.rules {
                if !entry.provides(&rule.subdir) {
                    continue;
                }
                let path = entry.path.join(&rule.subdir).display().to_string();
                env.search_paths
                    .entry(rule.variable.clone())
                    .or_default()
                    .push(path);
            }
        }

        if !store_paths.is_empty() {
            env.variables
                .insert(STORE_PATHS_VAR.to_string(), store_paths.join(DEFAULT_SEPARATOR));
        }
        tracing::debug!(contributors = env.contributors.len(), "composed environment");
        Ok(env)
    }
}

/// Compose with the default search path rules.
pub fn compose(
    graph: &ResolutionGraph,
    entries: &HashMap<NodeId, StoreEntry>,
) -> Result<EnvironmentDescriptor> {
    Composer::default().compose(graph, entries)
}

fn preorder(
    graph: &ResolutionGraph,
    id: NodeId,
    visited: &mut HashSet<NodeId>,
    order: &mut Vec<NodeId>,
) {
    if !visited.insert(id) {
        return;
    }
    order.push(id);
    for dep in &graph.node(id).dependencies {
        preorder(graph, *dep, visited, order);
    }
}
