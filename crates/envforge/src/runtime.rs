// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end environment creation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::compose::{Composer, SearchPathRule};
use crate::config::Config;
use crate::environment::{EnvironmentDescriptor, generate_startup_script, get_priority};
use crate::graph::ResolutionGraph;
use crate::lock::LockFile;
use crate::manifest::ComposedManifest;
use crate::realize::{BuildAction, Realization, Realizer};
use crate::repository::PackageRepository;
use crate::resolve::{DEFAULT_MAX_RESTARTS, Resolver};
use crate::store::StoreHandle;

#[cfg(test)]
#[path = "./runtime_test.rs"]
mod runtime_test;

/// Directory, relative to a runtime root, that holds startup scripts.
const STARTUP_FILES_LOCATION: &str = "etc/envforge/startup.d";

/// Cooperative cancellation shared between the caller and a running pipeline.
///
/// Checked between nodes; work already in progress is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        Ok(())
    }
}

/// Options for environment creation.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Prefer the versions recorded in this lock.
    pub lock: Option<LockFile>,
    pub concurrency: Option<usize>,
    pub max_restarts: usize,
    /// Search path rules, or the defaults when unset.
    pub rules: Option<Vec<SearchPathRule>>,
    pub cancel: Cancellation,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            lock: None,
            concurrency: None,
            max_restarts: DEFAULT_MAX_RESTARTS,
            rules: None,
            cancel: Cancellation::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: Some(config.realize.concurrency),
            max_restarts: config.resolve.max_restarts,
            ..Default::default()
        }
    }
}

/// A created environment and everything that went into it.
#[derive(Debug, Clone)]
pub struct Environment {
    pub graph: ResolutionGraph,
    pub realization: Realization,
    pub descriptor: EnvironmentDescriptor,
    /// Startup script priority from the manifests.
    pub priority: u8,
}

impl Environment {
    pub fn startup_script(&self) -> String {
        generate_startup_script(&self.descriptor)
    }

    /// Write the startup script under `root` and return its path.
    pub fn write_startup_script<P: AsRef<Path>>(&self, root: P) -> crate::Result<PathBuf> {
        let dir = root.as_ref().join(STARTUP_FILES_LOCATION);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{:02}_envforge.sh", self.priority));
        std::fs::write(&path, self.startup_script())?;
        Ok(path)
    }
}

/// Resolve, realize and compose the environment declared by `composed`.
#[tracing::instrument(skip_all, fields(sources = composed.source_count()))]
pub async fn create_environment(
    composed: &ComposedManifest,
    repository: Arc<dyn PackageRepository>,
    store: StoreHandle,
    action: Arc<dyn BuildAction>,
    options: &RuntimeOptions,
) -> crate::Result<Environment> {
    let mut resolver = Resolver::new(repository)
        .with_max_restarts(options.max_restarts)
        .with_cancellation(options.cancel.clone());
    if let Some(lock) = &options.lock {
        resolver = resolver.with_pins(lock.pins());
    }
    let graph = resolver.resolve(&composed.packages).await?;

    let mut realizer = Realizer::new(store, action).with_cancellation(options.cancel.clone());
    if let Some(concurrency) = options.concurrency {
        realizer = realizer.with_concurrency(concurrency);
    }
    let realization = realizer.realize_graph(&graph).await?;
    options.cancel.check()?;

    let composer = match &options.rules {
        Some(rules) => Composer::with_rules(rules.clone()),
        None => Composer::default(),
    };
    let mut descriptor = composer.compose(&graph, &realization.entries)?;
    descriptor.apply_ops(&composed.environment);

    tracing::info!(
        packages = graph.len(),
        built = realization.built.len(),
        "environment ready"
    );
    Ok(Environment {
        graph,
        realization,
        descriptor,
        priority: get_priority(&composed.environment),
    })
}
