// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Dependency graph resolution.
//!
//! Requests are expanded depth first against a [`PackageRepository`]. For
//! every package the highest version satisfying all constraints seen so far
//! is selected, keeping an earlier selection when it is still compatible.
//! When a later constraint rejects an earlier selection, the constraints on
//! that package are remembered and the traversal starts over, so the next
//! attempt selects a compatible version up front.
//!
//! A remembered constraint only holds while the package version that
//! imposed it is part of the attempt. Once every request is expanded, each
//! selection is checked against the constraints that still hold; one that
//! was narrowed by a constraint from a dropped version is retried without it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use semver::Version;

use crate::graph::{NodeId, PackageIdent, PackageNode, ResolutionGraph};
use crate::repository::PackageRepository;
use crate::request::PackageRequest;
use crate::runtime::Cancellation;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./resolve_test.rs"]
mod resolve_test;

/// Requester name used for the manifest's own requests.
pub const ROOT_REQUESTER: &str = "<manifest>";

/// Upper bound on traversal restarts for a single resolution.
pub const DEFAULT_MAX_RESTARTS: usize = 256;

/// A constraint together with the package that imposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveConstraint {
    request: PackageRequest,
    /// `None` for the manifest's own requests.
    requested_by: Option<PackageIdent>,
}

impl ActiveConstraint {
    fn describe(&self) -> String {
        let requester = match &self.requested_by {
            Some(ident) => ident.to_string(),
            None => ROOT_REQUESTER.to_string(),
        };
        format!("{} (from {requester})", self.request.constraint_string())
    }
}

/// Whether a remembered constraint holds in the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relevance {
    /// Imposed by the manifest or by a version selected in this attempt.
    Confirmed,
    /// The requester has not been selected yet.
    Anticipated,
    /// The requester was selected at a different version.
    Stale,
}

/// Resolves package requests into a [`ResolutionGraph`].
#[derive(Clone)]
pub struct Resolver {
    repository: Arc<dyn PackageRepository>,
    pins: HashMap<String, Version>,
    max_restarts: usize,
    cancel: Cancellation,
}

impl Resolver {
    pub fn new(repository: Arc<dyn PackageRepository>) -> Self {
        Self {
            repository,
            pins: HashMap::new(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            cancel: Cancellation::default(),
        }
    }

    /// Prefer these versions whenever they satisfy every constraint.
    pub fn with_pins(mut self, pins: HashMap<String, Version>) -> Self {
        self.pins = pins;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve `requests` into a validated, acyclic graph.
    #[tracing::instrument(skip_all, fields(requests = requests.len()))]
    pub async fn resolve(&self, requests: &[PackageRequest]) -> Result<ResolutionGraph> {
        let mut learned: HashMap<String, Vec<ActiveConstraint>> = HashMap::new();
        let mut restarts = 0;

        loop {
            let mut attempt = Attempt::new(self, learned.clone());
            let interrupt = match attempt.run(requests).await {
                Ok(graph) => {
                    graph.validate()?;
                    tracing::info!(nodes = graph.len(), restarts, "resolved environment");
                    return Ok(graph);
                }
                Err(Interrupt::Fail(err)) => return Err(err),
                Err(interrupt) => interrupt,
            };

            restarts += 1;
            if restarts > self.max_restarts {
                let (name, constraints) = match interrupt {
                    Interrupt::Restart(name) => {
                        let constraints = attempt.constraints.remove(&name).unwrap_or_default();
                        (name, constraints)
                    }
                    Interrupt::Relax(stale) => stale.into_iter().next().unwrap_or_default(),
                    Interrupt::Fail(err) => return Err(err),
                };
                return Err(Error::UnsatisfiableConstraint {
                    constraints: constraints.iter().map(|c| c.describe()).collect(),
                    name,
                });
            }

            match interrupt {
                Interrupt::Restart(name) => {
                    tracing::debug!(package = %name, restarts, "restarting with learned constraints");
                    let constraints = attempt.constraints.remove(&name).unwrap_or_default();
                    let known = learned.entry(name).or_default();
                    for constraint in constraints {
                        if !known.contains(&constraint) {
                            known.push(constraint);
                        }
                    }
                }
                Interrupt::Relax(stale) => {
                    for (name, dropped) in stale {
                        tracing::debug!(package = %name, restarts, "forgetting constraints of dropped versions");
                        if let Some(known) = learned.get_mut(&name) {
                            known.retain(|c| !dropped.contains(c));
                        }
                    }
                }
                Interrupt::Fail(err) => return Err(err),
            }
        }
    }
}

/// Why a traversal attempt stopped early.
enum Interrupt {
    /// Start over with the current constraints on this package remembered.
    Restart(String),
    /// Start over without these remembered constraints.
    Relax(BTreeMap<String, Vec<ActiveConstraint>>),
    Fail(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Self::Fail(err)
    }
}

/// State of one depth-first traversal.
struct Attempt<'r> {
    resolver: &'r Resolver,
    /// Constraints remembered from earlier attempts.
    learned: HashMap<String, Vec<ActiveConstraint>>,
    graph: ResolutionGraph,
    /// Constraints imposed during this attempt.
    constraints: HashMap<String, Vec<ActiveConstraint>>,
    chosen: HashMap<String, Version>,
    selected: HashMap<String, NodeId>,
    in_progress: HashSet<String>,
    stack: Vec<String>,
}

impl<'r> Attempt<'r> {
    fn new(resolver: &'r Resolver, learned: HashMap<String, Vec<ActiveConstraint>>) -> Self {
        Self {
            resolver,
            learned,
            graph: ResolutionGraph::new(),
            constraints: HashMap::new(),
            chosen: HashMap::new(),
            selected: HashMap::new(),
            in_progress: HashSet::new(),
            stack: Vec::new(),
        }
    }

    async fn run(&mut self, requests: &[PackageRequest]) -> std::result::Result<ResolutionGraph, Interrupt> {
        for request in requests {
            let id = self.visit(request.clone(), None).await?;
            self.graph.add_root(id);
        }
        let stale = self.stale_learning().await?;
        if !stale.is_empty() {
            return Err(Interrupt::Relax(stale));
        }
        Ok(std::mem::take(&mut self.graph))
    }

    fn visit(
        &mut self,
        request: PackageRequest,
        requested_by: Option<PackageIdent>,
    ) -> BoxFuture<'_, std::result::Result<NodeId, Interrupt>> {
        Box::pin(async move {
            self.resolver.cancel.check()?;
            let name = request.name.clone();

            if self.in_progress.contains(&name) {
                let start = self.stack.iter().position(|n| n == &name).unwrap_or(0);
                let mut cycle: Vec<String> = self.stack[start..].to_vec();
                cycle.push(name);
                return Err(Error::CycleDetected { cycle }.into());
            }

            let constraint = ActiveConstraint {
                request,
                requested_by,
            };
            let active = self.constraints.entry(name.clone()).or_default();
            if !active.contains(&constraint) {
                active.push(constraint);
            }

            if let Some(&id) = self.selected.get(&name) {
                let version = &self.graph.node(id).ident.version;
                if self.satisfies_all(&name, version) {
                    return Ok(id);
                }
                // An earlier choice is now rejected; see whether anything fits.
                self.select_version(&name).await?;
                return Err(Interrupt::Restart(name));
            }

            let version = self.select_version(&name).await?;
            self.chosen.insert(name.clone(), version.clone());
            let ident = PackageIdent::new(name.clone(), version);
            tracing::debug!(package = %ident, "selected");

            self.in_progress.insert(name.clone());
            self.stack.push(name.clone());

            let repository = self.resolver.repository.clone();
            let requests = repository
                .list_dependencies(&ident.name, &ident.version)
                .await?;
            let mut dependencies: Vec<NodeId> = Vec::with_capacity(requests.len());
            for dep in requests {
                let id = self.visit(dep, Some(ident.clone())).await?;
                if !dependencies.contains(&id) {
                    dependencies.push(id);
                }
            }

            let inputs = repository
                .build_inputs(&ident.name, &ident.version)
                .await?;
            let dep_descriptors: Vec<_> = dependencies
                .iter()
                .map(|id| self.graph.node(*id).descriptor)
                .collect();
            let descriptor = inputs.descriptor(&dep_descriptors);

            self.stack.pop();
            self.in_progress.remove(&name);

            let id = self.graph.push(PackageNode {
                ident,
                dependencies,
                descriptor,
            })?;
            self.selected.insert(name, id);
            Ok(id)
        })
    }

    fn relevance(&self, constraint: &ActiveConstraint) -> Relevance {
        let Some(requester) = &constraint.requested_by else {
            return Relevance::Confirmed;
        };
        match self.chosen.get(&requester.name) {
            Some(version) if *version == requester.version => Relevance::Confirmed,
            Some(_) => Relevance::Stale,
            None => Relevance::Anticipated,
        }
    }

    fn learned_with(&self, name: &str, relevance: Relevance) -> impl Iterator<Item = &ActiveConstraint> {
        self.learned
            .get(name)
            .into_iter()
            .flatten()
            .filter(move |c| self.relevance(c) == relevance)
    }

    /// Constraints on `name` that hold in this attempt, without duplicates.
    fn confirmed(&self, name: &str) -> Vec<&ActiveConstraint> {
        let mut confirmed: Vec<&ActiveConstraint> = Vec::new();
        let active = self.constraints.get(name).into_iter().flatten();
        for constraint in active.chain(self.learned_with(name, Relevance::Confirmed)) {
            if !confirmed.contains(&constraint) {
                confirmed.push(constraint);
            }
        }
        confirmed
    }

    fn satisfies_all(&self, name: &str, version: &Version) -> bool {
        self.confirmed(name)
            .iter()
            .all(|c| c.request.matches(version))
    }

    /// The pinned version when it is a candidate, otherwise the highest.
    fn pick(&self, name: &str, candidates: &[&Version]) -> Option<Version> {
        if let Some(pin) = self.resolver.pins.get(name) {
            if candidates.contains(&pin) {
                return Some(pin.clone());
            }
            tracing::debug!(package = %name, %pin, "pinned version no longer satisfies constraints");
        }
        candidates.iter().max().map(|v| (*v).clone())
    }

    /// Highest version satisfying every constraint that holds, preferring
    /// one that also satisfies the anticipated constraints.
    async fn select_version(&self, name: &str) -> Result<Version> {
        let versions = self.resolver.repository.list_versions(name).await?;
        let candidates: Vec<&Version> = versions
            .iter()
            .filter(|v| self.satisfies_all(name, v))
            .collect();
        let preferred: Vec<&Version> = candidates
            .iter()
            .copied()
            .filter(|v| {
                self.learned_with(name, Relevance::Anticipated)
                    .all(|c| c.request.matches(v))
            })
            .collect();
        let candidates = if preferred.is_empty() {
            candidates
        } else {
            preferred
        };

        self.pick(name, &candidates)
            .ok_or_else(|| Error::UnsatisfiableConstraint {
                name: name.to_string(),
                constraints: self
                    .confirmed(name)
                    .iter()
                    .map(|c| c.describe())
                    .collect(),
            })
    }

    /// Remembered constraints that held a selection below the version the
    /// final set of constraints allows, keyed by package.
    async fn stale_learning(&self) -> Result<BTreeMap<String, Vec<ActiveConstraint>>> {
        let mut stale = BTreeMap::new();
        for (name, id) in &self.selected {
            let versions = self.resolver.repository.list_versions(name).await?;
            let candidates: Vec<&Version> = versions
                .iter()
                .filter(|v| self.satisfies_all(name, v))
                .collect();
            let selected = &self.graph.node(*id).ident.version;
            if self.pick(name, &candidates).as_ref() == Some(selected) {
                continue;
            }
            let unused: Vec<ActiveConstraint> = self
                .learned
                .get(name)
                .into_iter()
                .flatten()
                .filter(|c| self.relevance(c) != Relevance::Confirmed)
                .cloned()
                .collect();
            if !unused.is_empty() {
                stale.insert(name.clone(), unused);
            }
        }
        Ok(stale)
    }
}
