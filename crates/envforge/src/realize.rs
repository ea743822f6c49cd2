// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Realization of resolved packages into the store.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::error::BoxError;
use crate::graph::{NodeId, PackageNode, ResolutionGraph};
use crate::runtime::Cancellation;
use crate::store::{Artifact, StoreEntry, StoreHandle};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./realize_test.rs"]
mod realize_test;

/// Produces the content of a package, by building or fetching it.
///
/// `dependencies` holds the realized entries of the node's dependencies, in
/// the node's declaration order.
#[async_trait]
pub trait BuildAction: Send + Sync {
    async fn build(
        &self,
        node: &PackageNode,
        dependencies: &[StoreEntry],
    ) -> std::result::Result<Artifact, BoxError>;
}

#[async_trait]
impl<F> BuildAction for F
where
    F: Fn(&PackageNode, &[StoreEntry]) -> std::result::Result<Artifact, BoxError> + Send + Sync,
{
    async fn build(
        &self,
        node: &PackageNode,
        dependencies: &[StoreEntry],
    ) -> std::result::Result<Artifact, BoxError> {
        self(node, dependencies)
    }
}

/// Result of realizing a whole graph.
#[derive(Debug, Clone, Default)]
pub struct Realization {
    pub entries: HashMap<NodeId, StoreEntry>,
    /// Nodes whose content was produced by the build action.
    pub built: Vec<NodeId>,
    /// Nodes found already committed in the store.
    pub reused: Vec<NodeId>,
}

impl Realization {
    pub fn entry(&self, id: NodeId) -> Option<&StoreEntry> {
        self.entries.get(&id)
    }
}

/// Realizes nodes in dependency order, invoking the build action for store misses.
#[derive(Clone)]
pub struct Realizer {
    store: StoreHandle,
    action: Arc<dyn BuildAction>,
    concurrency: usize,
    cancel: Cancellation,
}

impl Realizer {
    pub fn new(store: StoreHandle, action: Arc<dyn BuildAction>) -> Self {
        Self {
            store,
            action,
            concurrency: default_concurrency(),
            cancel: Cancellation::default(),
        }
    }

    /// Maximum number of nodes realized at the same time (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Realize one node whose dependencies are already realized.
    pub async fn realize(
        &self,
        node: &PackageNode,
        dependencies: &[StoreEntry],
    ) -> Result<StoreEntry> {
        Ok(self.realize_node(node, dependencies).await?.0)
    }

    /// Realize every node of `graph`, dependencies first.
    ///
    /// Independent nodes run concurrently. On the first failure no new node
    /// is started; nodes already running are allowed to finish and their
    /// entries stay committed.
    #[tracing::instrument(skip_all, fields(nodes = graph.len()))]
    pub async fn realize_graph(&self, graph: &ResolutionGraph) -> Result<Realization> {
        let dependents = graph.dependents();
        let mut waiting: Vec<usize> = graph.iter().map(|(_, n)| n.dependencies.len()).collect();
        let mut ready: VecDeque<NodeId> = graph
            .topological_order()
            .filter(|id| waiting[id.index()] == 0)
            .collect();

        let mut realization = Realization::default();
        let mut tasks = JoinSet::new();
        let mut failure: Option<Error> = None;

        loop {
            while failure.is_none() && tasks.len() < self.concurrency {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                if let Err(err) = self.cancel.check() {
                    failure = Some(err);
                    break;
                }
                let node = graph.node(id).clone();
                let mut deps = Vec::with_capacity(node.dependencies.len());
                for dep in &node.dependencies {
                    match realization.entries.get(dep) {
                        Some(entry) => deps.push(entry.clone()),
                        None => {
                            return Err(Error::InvalidGraph(format!(
                                "{} scheduled before its dependencies",
                                node.ident
                            )));
                        }
                    }
                }
                let realizer = self.clone();
                tasks.spawn(async move { (id, realizer.realize_node(&node, &deps).await) });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((id, Ok((entry, built)))) => {
                    if built {
                        realization.built.push(id);
                    } else {
                        realization.reused.push(id);
                    }
                    realization.entries.insert(id, entry);
                    for dependent in &dependents[id.index()] {
                        waiting[dependent.index()] -= 1;
                        if waiting[dependent.index()] == 0 {
                            ready.push_back(*dependent);
                        }
                    }
                }
                Ok((_, Err(err))) => {
                    tracing::warn!(error = %err, "realization failed, draining running nodes");
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    failure.get_or_insert(Error::Io(std::io::Error::other(join_err)));
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if realization.entries.len() != graph.len() {
            return Err(Error::InvalidGraph(
                "not every node became ready; the graph is not closed".to_string(),
            ));
        }

        realization.built.sort();
        realization.reused.sort();
        tracing::info!(
            built = realization.built.len(),
            reused = realization.reused.len(),
            "realized environment"
        );
        Ok(realization)
    }

    /// Returns the entry and whether the build action ran.
    async fn realize_node(
        &self,
        node: &PackageNode,
        dependencies: &[StoreEntry],
    ) -> Result<(StoreEntry, bool)> {
        if dependencies.len() != node.dependencies.len() {
            return Err(Error::IncompleteRealization {
                node: node.ident.clone(),
            });
        }

        let address = node.address();
        let _guard = self.store.lock_address(&address).await;

        if self.store.has(&address).await? {
            tracing::debug!(package = %node.ident, address = %address.short(), "reusing store entry");
            return Ok((self.store.get(&address).await?, false));
        }

        for dep in dependencies {
            if !self.store.has(&dep.address).await? {
                return Err(Error::EntryNotFound(dep.address));
            }
        }

        tracing::info!(package = %node.ident, address = %address.short(), "building");
        let artifact = self
            .action
            .build(node, dependencies)
            .await
            .map_err(|source| Error::RealizationFailed {
                node: node.ident.clone(),
                source,
            })?;

        let references: BTreeSet<_> = dependencies.iter().map(|d| d.address).collect();
        let entry = self.store.commit(&address, artifact, references).await?;
        Ok((entry, true))
    }
}

pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
