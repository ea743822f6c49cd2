// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicUsize;

use tempfile::TempDir;

use super::*;
use crate::discovery::{DiscoveryOptions, discover_manifests};
use crate::error::BoxError;
use crate::graph::PackageNode;
use crate::lock::generate_lock;
use crate::manifest::compose_manifests;
use crate::repository::MemoryRepository;
use crate::store::{Artifact, StoreEntry};

const INDEX: &str = r#"
api: envforge/v0/index
packages:
  a:
    - version: 1.0.0
      dependencies: [b, c]
  b:
    - version: 1.0.0
      dependencies: [d]
  c:
    - version: 1.0.0
      dependencies: [d]
  d:
    - version: 1.0.0
    - version: 1.1.0
"#;

/// Counts builds and lays out a binary per package plus a library for `d`.
#[derive(Default)]
struct CountingAction {
    builds: AtomicUsize,
}

#[async_trait::async_trait]
impl BuildAction for CountingAction {
    async fn build(
        &self,
        node: &PackageNode,
        _dependencies: &[StoreEntry],
    ) -> std::result::Result<Artifact, BoxError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let name = &node.ident.name;
        let mut artifact = Artifact::new().with_file(format!("bin/{name}"), node.ident.to_string());
        if name == "d" {
            artifact = artifact.with_file("lib/libd.so", node.ident.to_string());
        }
        Ok(artifact)
    }
}

fn project(manifest: &str) -> (TempDir, ComposedManifest) {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join(crate::ENVFORGE_FILENAME), manifest).unwrap();
    let manifests = discover_manifests(tmp.path(), &DiscoveryOptions::default()).unwrap();
    (tmp, compose_manifests(&manifests))
}

fn repository() -> Arc<dyn PackageRepository> {
    let index = crate::repository::RepositoryIndex::from_yaml(INDEX).unwrap();
    Arc::new(MemoryRepository::from_index(index))
}

const MANIFEST: &str = r#"
api: envforge/v0
packages:
  - a
environment:
  - set: EDITOR
    value: vi
  - priority: 20
"#;

#[tokio::test]
async fn test_create_environment_end_to_end() {
    let (tmp, composed) = project(MANIFEST);
    let store = StoreHandle::open(tmp.path().join("store")).unwrap();
    let action = Arc::new(CountingAction::default());

    let env = create_environment(
        &composed,
        repository(),
        store.clone(),
        action.clone(),
        &RuntimeOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(env.graph.len(), 4);
    assert_eq!(action.builds.load(Ordering::SeqCst), 4);
    assert_eq!(env.descriptor.contributors.len(), 4);
    assert_eq!(env.descriptor.search_paths["PATH"].len(), 4);
    assert_eq!(env.descriptor.search_paths["LD_LIBRARY_PATH"].len(), 1);
    assert_eq!(env.descriptor.get("EDITOR").as_deref(), Some("vi"));
    assert_eq!(env.priority, 20);
    assert_eq!(store.entries().await.unwrap().len(), 4);

    let d = env.graph.node(env.graph.find("d").unwrap());
    assert_eq!(d.ident.version, semver::Version::new(1, 1, 0));

    let script = env.startup_script();
    assert!(script.contains("export EDITOR=\"vi\""));
    assert!(script.contains("export PATH=\""));
}

#[tokio::test]
async fn test_second_run_is_identical_and_builds_nothing() {
    let (tmp, composed) = project(MANIFEST);
    let store = StoreHandle::open(tmp.path().join("store")).unwrap();

    let first_action = Arc::new(CountingAction::default());
    let first = create_environment(
        &composed,
        repository(),
        store.clone(),
        first_action.clone(),
        &RuntimeOptions::default(),
    )
    .await
    .unwrap();

    // A fresh handle over the same root sees every committed entry.
    let reopened = StoreHandle::open(tmp.path().join("store")).unwrap();
    let second_action = Arc::new(CountingAction::default());
    let second = create_environment(
        &composed,
        repository(),
        reopened,
        second_action.clone(),
        &RuntimeOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(second_action.builds.load(Ordering::SeqCst), 0);
    assert_eq!(second.realization.reused.len(), 4);
    assert_eq!(first.descriptor, second.descriptor);
    assert_eq!(first.startup_script(), second.startup_script());
}

#[tokio::test]
async fn test_lock_pins_versions() {
    let (_tmp, composed) = project(MANIFEST);
    let mut repo = MemoryRepository::new();
    repo.add("a", "1.0.0", &["b", "c"]).unwrap();
    repo.add("b", "1.0.0", &["d"]).unwrap();
    repo.add("c", "1.0.0", &["d"]).unwrap();
    repo.add("d", "1.0.0", &[]).unwrap();
    let old = create_environment(
        &composed,
        Arc::new(repo),
        StoreHandle::memory(),
        Arc::new(CountingAction::default()),
        &RuntimeOptions::default(),
    )
    .await
    .unwrap();
    let lock = generate_lock(&composed, &old.graph).unwrap();

    let options = RuntimeOptions {
        lock: Some(lock),
        ..Default::default()
    };
    let pinned = create_environment(
        &composed,
        repository(),
        StoreHandle::memory(),
        Arc::new(CountingAction::default()),
        &options,
    )
    .await
    .unwrap();
    let d = pinned.graph.node(pinned.graph.find("d").unwrap());
    assert_eq!(d.ident.version, semver::Version::new(1, 0, 0));
}

#[tokio::test]
async fn test_cancelled_pipeline() {
    let (_tmp, composed) = project(MANIFEST);
    let options = RuntimeOptions::default();
    options.cancel.cancel();
    let action = Arc::new(CountingAction::default());

    let result = create_environment(
        &composed,
        repository(),
        StoreHandle::memory(),
        action.clone(),
        &options,
    )
    .await;
    assert!(matches!(result, Err(crate::Error::Cancelled)));
    assert_eq!(action.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_build_surfaces_node() {
    let (_tmp, composed) = project(MANIFEST);
    let action = |node: &PackageNode, _: &[StoreEntry]| -> std::result::Result<Artifact, BoxError> {
        if node.ident.name == "b" {
            return Err("missing compiler".into());
        }
        Ok(Artifact::new().with_file("bin/tool", "tool"))
    };
    let result = create_environment(
        &composed,
        repository(),
        StoreHandle::memory(),
        Arc::new(action),
        &RuntimeOptions::default(),
    )
    .await;
    match result {
        Err(err @ crate::Error::RealizationFailed { .. }) => {
            assert!(err.is_retryable());
            assert!(err.to_string().contains("b/1.0.0"));
        }
        other => panic!("Expected RealizationFailed, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_write_startup_script() {
    let (tmp, composed) = project(MANIFEST);
    let env = create_environment(
        &composed,
        repository(),
        StoreHandle::memory(),
        Arc::new(CountingAction::default()),
        &RuntimeOptions::default(),
    )
    .await
    .unwrap();

    let path = env.write_startup_script(tmp.path().join("runtime")).unwrap();
    assert!(path.ends_with("etc/envforge/startup.d/20_envforge.sh"));
    assert_eq!(std::fs::read_to_string(path).unwrap(), env.startup_script());
}

#[test]
fn test_cancellation_is_shared_between_clones() {
    let cancel = Cancellation::new();
    let observer = cancel.clone();
    assert!(observer.check().is_ok());
    cancel.cancel();
    assert!(observer.is_cancelled());
    assert!(matches!(observer.check(), Err(crate::Error::Cancelled)));
}

#[test]
fn test_options_from_config() {
    let config = Config {
        realize: crate::config::RealizeConfig { concurrency: 3 },
        resolve: crate::config::ResolveConfig { max_restarts: 7 },
        ..Default::default()
    };
    let options = RuntimeOptions::from_config(&config);
    assert_eq!(options.concurrency, Some(3));
    assert_eq!(options.max_restarts, 7);
    assert!(options.lock.is_none());
}
