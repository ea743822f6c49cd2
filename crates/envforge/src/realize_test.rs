// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use semver::Version;

use super::*;
use crate::repository::{BuildInputs, MemoryRepository};
use crate::request::PackageRequest;
use crate::resolve::Resolver;

/// Records build order and rejects builds whose dependencies are missing.
#[derive(Default)]
struct RecordingAction {
    store: Option<StoreHandle>,
    order: Mutex<Vec<String>>,
    fail_on: Option<String>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingAction {
    fn new(store: &StoreHandle) -> Self {
        Self {
            store: Some(store.clone()),
            ..Default::default()
        }
    }

    fn builds(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildAction for RecordingAction {
    async fn build(
        &self,
        node: &PackageNode,
        dependencies: &[StoreEntry],
    ) -> std::result::Result<Artifact, BoxError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if let Some(store) = &self.store {
            for dep in dependencies {
                assert!(store.has(&dep.address).await.unwrap());
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on.as_deref() == Some(node.ident.name.as_str()) {
            return Err(format!("compiler crashed while building {}", node.ident).into());
        }
        self.order.lock().unwrap().push(node.ident.name.clone());
        Ok(Artifact::new().with_file(
            format!("bin/{}", node.ident.name),
            format!("#!/bin/sh\necho {}\n", node.ident),
        ))
    }
}

async fn diamond() -> ResolutionGraph {
    let mut repo = MemoryRepository::new();
    repo.add("a", "1.0.0", &["b", "c"]).unwrap();
    repo.add("b", "1.0.0", &["d"]).unwrap();
    repo.add("c", "1.0.0", &["d"]).unwrap();
    repo.add("d", "1.0.0", &[]).unwrap();
    Resolver::new(Arc::new(repo))
        .resolve(&[PackageRequest::new("a")])
        .await
        .unwrap()
}

fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
}

#[tokio::test]
async fn test_diamond_realized_in_dependency_order() {
    let graph = diamond().await;
    let store = StoreHandle::memory();
    let action = Arc::new(RecordingAction::new(&store));
    let realizer = Realizer::new(store.clone(), action.clone()).with_concurrency(4);

    let realization = realizer.realize_graph(&graph).await.unwrap();

    let order = action.builds();
    assert_eq!(order.len(), 4);
    assert!(position(&order, "d") < position(&order, "b"));
    assert!(position(&order, "d") < position(&order, "c"));
    assert!(position(&order, "b") < position(&order, "a"));
    assert!(position(&order, "c") < position(&order, "a"));
    assert_eq!(realization.built.len(), 4);
    assert!(realization.reused.is_empty());

    let a = graph.find("a").unwrap();
    let b = graph.find("b").unwrap();
    let c = graph.find("c").unwrap();
    let a_entry = realization.entry(a).unwrap();
    let expected: BTreeSet<_> = [
        realization.entry(b).unwrap().address,
        realization.entry(c).unwrap().address,
    ]
    .into_iter()
    .collect();
    assert_eq!(a_entry.references, expected);

    let d = graph.find("d").unwrap();
    let d_referrers = store
        .referrers(&realization.entry(d).unwrap().address)
        .await
        .unwrap();
    assert_eq!(d_referrers.len(), 2);
}

#[tokio::test]
async fn test_second_realization_runs_no_builds() {
    let graph = diamond().await;
    let store = StoreHandle::memory();

    let first_action = Arc::new(RecordingAction::new(&store));
    let first = Realizer::new(store.clone(), first_action.clone())
        .realize_graph(&graph)
        .await
        .unwrap();

    let second_action = Arc::new(RecordingAction::new(&store));
    let second = Realizer::new(store.clone(), second_action.clone())
        .realize_graph(&graph)
        .await
        .unwrap();

    assert!(second_action.builds().is_empty());
    assert_eq!(second.reused.len(), graph.len());
    assert!(second.built.is_empty());
    for (id, _) in graph.iter() {
        assert_eq!(first.entry(id), second.entry(id));
    }
}

#[tokio::test]
async fn test_failure_keeps_committed_entries_for_restart() {
    let graph = diamond().await;
    let store = StoreHandle::memory();

    let failing = Arc::new(RecordingAction {
        fail_on: Some("c".to_string()),
        ..RecordingAction::new(&store)
    });
    let result = Realizer::new(store.clone(), failing.clone())
        .with_concurrency(1)
        .realize_graph(&graph)
        .await;

    match result {
        Err(Error::RealizationFailed { node, source }) => {
            assert_eq!(node.name, "c");
            assert!(source.to_string().contains("compiler crashed"));
        }
        other => panic!("Expected RealizationFailed, got: {other:?}"),
    }
    let a_address = graph.node(graph.find("a").unwrap()).address();
    assert!(!store.has(&a_address).await.unwrap());
    let d_address = graph.node(graph.find("d").unwrap()).address();
    assert!(store.has(&d_address).await.unwrap());

    let retry = Arc::new(RecordingAction::new(&store));
    let realization = Realizer::new(store.clone(), retry.clone())
        .realize_graph(&graph)
        .await
        .unwrap();
    let rebuilt = retry.builds();
    assert!(!rebuilt.contains(&"d".to_string()));
    assert!(rebuilt.contains(&"c".to_string()));
    assert!(rebuilt.contains(&"a".to_string()));
    assert_eq!(realization.entries.len(), 4);
}

#[tokio::test]
async fn test_identical_descriptors_built_once() {
    let mut repo = MemoryRepository::new();
    repo.add("gcc", "13.2.0", &[]).unwrap();
    repo.add("cc", "13.2.0", &[]).unwrap();
    let version = Version::new(13, 2, 0);
    let inputs = BuildInputs {
        sources: vec!["gcc-13.2.0.tar.xz".to_string()],
        ..Default::default()
    };
    repo.set_inputs("gcc", &version, inputs.clone()).unwrap();
    repo.set_inputs("cc", &version, inputs).unwrap();
    let graph = Resolver::new(Arc::new(repo))
        .resolve(&[PackageRequest::new("gcc"), PackageRequest::new("cc")])
        .await
        .unwrap();

    let store = StoreHandle::memory();
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let action = move |_: &PackageNode, _: &[StoreEntry]| -> std::result::Result<Artifact, BoxError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Artifact::new().with_file("bin/cc", "compiler"))
    };
    let realization = Realizer::new(store.clone(), Arc::new(action))
        .with_concurrency(2)
        .realize_graph(&graph)
        .await
        .unwrap();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    let gcc = realization.entry(graph.find("gcc").unwrap()).unwrap();
    let cc = realization.entry(graph.find("cc").unwrap()).unwrap();
    assert_eq!(gcc.address, cc.address);
    assert_eq!(store.entries().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_nodes_realize_concurrently() {
    let mut repo = MemoryRepository::new();
    for name in ["w", "x", "y", "z"] {
        repo.add(name, "1.0.0", &[]).unwrap();
    }
    let graph = Resolver::new(Arc::new(repo))
        .resolve(&["w", "x", "y", "z"].map(PackageRequest::new))
        .await
        .unwrap();

    let store = StoreHandle::memory();
    let action = Arc::new(RecordingAction {
        delay: Some(Duration::from_millis(50)),
        ..RecordingAction::new(&store)
    });
    Realizer::new(store, action.clone())
        .with_concurrency(4)
        .realize_graph(&graph)
        .await
        .unwrap();

    assert!(action.max_active.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
    let mut repo = MemoryRepository::new();
    for name in ["w", "x", "y", "z"] {
        repo.add(name, "1.0.0", &[]).unwrap();
    }
    let graph = Resolver::new(Arc::new(repo))
        .resolve(&["w", "x", "y", "z"].map(PackageRequest::new))
        .await
        .unwrap();

    let store = StoreHandle::memory();
    let action = Arc::new(RecordingAction {
        delay: Some(Duration::from_millis(10)),
        ..RecordingAction::new(&store)
    });
    Realizer::new(store, action.clone())
        .with_concurrency(1)
        .realize_graph(&graph)
        .await
        .unwrap();

    assert_eq!(action.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_realizations_share_store() {
    let graph = Arc::new(diamond().await);
    let store = StoreHandle::memory();
    let action = Arc::new(RecordingAction {
        delay: Some(Duration::from_millis(5)),
        ..RecordingAction::new(&store)
    });

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let realizer = Realizer::new(store.clone(), action.clone());
        let graph = graph.clone();
        tasks.push(tokio::spawn(async move {
            realizer.realize_graph(&graph).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // At most one realization per address.
    assert_eq!(action.builds().len(), graph.len());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let graph = diamond().await;
    let store = StoreHandle::memory();
    let action = Arc::new(RecordingAction::new(&store));
    let cancel = Cancellation::new();
    cancel.cancel();

    let result = Realizer::new(store, action.clone())
        .with_cancellation(cancel)
        .realize_graph(&graph)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(action.builds().is_empty());
}

#[tokio::test]
async fn test_realize_single_node_requires_dependencies() {
    let graph = diamond().await;
    let store = StoreHandle::memory();
    let realizer = Realizer::new(store, Arc::new(RecordingAction::default()));
    let a = graph.node(graph.find("a").unwrap());

    let result = realizer.realize(a, &[]).await;
    assert!(matches!(result, Err(Error::IncompleteRealization { .. })));
}

#[tokio::test]
async fn test_realize_single_leaf() {
    let graph = diamond().await;
    let store = StoreHandle::memory();
    let realizer = Realizer::new(store.clone(), Arc::new(RecordingAction::default()));
    let d = graph.node(graph.find("d").unwrap());

    let entry = realizer.realize(d, &[]).await.unwrap();
    assert_eq!(entry.address, d.address());
    assert!(entry.provides("bin"));
    assert_eq!(store.get(&d.address()).await.unwrap(), entry);
}
