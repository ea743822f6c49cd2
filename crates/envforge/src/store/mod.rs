// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Content-addressed storage of realized packages.
//!
//! Every entry lives at an address computed from the build inputs of the
//! package it holds. Entries are immutable: committing an address a second
//! time is only allowed with identical content.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::digest::{Digest, DigestBuilder};
use crate::{Error, Result};

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;


/// The content produced by a build or fetch action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    /// Relative file path to file content.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Artifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file<P: Into<String>, C: Into<Vec<u8>>>(mut self, path: P, content: C) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Canonical hash of the artifact's files.
    pub fn content_digest(&self) -> Digest {
        let mut hasher = DigestBuilder::new("envforge/artifact/v0");
        hasher.write_count(self.files.len());
        for (path, content) in &self.files {
            hasher.write_str(path).write_bytes(content);
        }
        hasher.finish()
    }

    /// Every directory that contains at least one file, as `/` separated
    /// relative paths (`bin`, `lib`, `lib/pkgconfig`, ...).
    pub fn directories(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for path in self.files.keys() {
            let mut parts: Vec<&str> = path.split('/').collect();
            parts.pop();
            for end in 1..=parts.len() {
                dirs.insert(parts[..end].join("/"));
            }
        }
        dirs
    }

    /// Reject absolute paths and paths that escape the artifact root.
    pub fn validate(&self) -> Result<()> {
        for path in self.files.keys() {
            let relative = Path::new(path);
            let normal = !path.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !normal {
                return Err(Error::ValidationFailed(format!(
                    "artifact path '{path}' must be relative and may not contain '.' or '..'"
                )));
            }
        }
        Ok(())
    }
}

/// A committed, immutable store entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreEntry {
    pub address: Digest,
    /// Location of the realized artifact.
    pub path: PathBuf,
    /// Hash of the artifact content.
    pub content: Digest,
    /// Addresses this entry depends on.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub references: BTreeSet<Digest>,
    /// Directories provided by the artifact.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub directories: BTreeSet<String>,
}

impl StoreEntry {
    pub(crate) fn new(
        address: Digest,
        path: PathBuf,
        artifact: &Artifact,
        references: BTreeSet<Digest>,
    ) -> Self {
        Self {
            address,
            path,
            content: artifact.content_digest(),
            references,
            directories: artifact.directories(),
        }
    }

    /// True if the artifact provides the given relative directory.
    pub fn provides(&self, dir: &str) -> bool {
        self.directories.contains(dir)
    }

    /// Check that a second commit of this address carries the same content.
    pub(crate) fn ensure_same_content(&self, artifact: &Artifact) -> Result<()> {
        let actual = artifact.content_digest();
        if actual != self.content {
            return Err(Error::ContentMismatch {
                address: self.address,
                expected: self.content,
                actual,
            });
        }
        Ok(())
    }
}

/// Storage backend for realized packages.
#[async_trait]
pub trait Store: Send + Sync {
    /// Root location of this store.
    fn root(&self) -> &Path;

    async fn has(&self, address: &Digest) -> Result<bool>;

    /// Fails with [`Error::EntryNotFound`] for unknown addresses.
    async fn get(&self, address: &Digest) -> Result<StoreEntry>;

    /// Commit an artifact at `address`.
    ///
    /// Idempotent for equal content, [`Error::ContentMismatch`] otherwise.
    /// Every reference must already be committed.
    async fn commit(
        &self,
        address: &Digest,
        artifact: Artifact,
        references: BTreeSet<Digest>,
    ) -> Result<StoreEntry>;

    /// All committed entries, ordered by address.
    async fn entries(&self) -> Result<Vec<StoreEntry>>;

    /// Entries that reference `address`.
    async fn referrers(&self, address: &Digest) -> Result<BTreeSet<Digest>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.references.contains(address))
            .map(|e| e.address)
            .collect())
    }
}

/// Shared handle to a store plus its per-address lock table.
///
/// Clones share both the backend and the locks.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn Store>,
    locks: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("root", &self.store.root())
            .finish()
    }
}

impl StoreHandle {
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn memory() -> Self {
        Self::new(MemoryStore::default())
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self::new(FsStore::open(root)?))
    }

    /// Serialize work on one address.
    ///
    /// Holders of different addresses never wait on each other.
    pub async fn lock_address(&self, address: &Digest) -> AddressGuard {
        let mutex = self
            .locks
            .entry(*address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        AddressGuard {
            guard: Some(mutex.lock_owned().await),
            address: *address,
            locks: self.locks.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub async fn has(&self, address: &Digest) -> Result<bool> {
        self.store.has(address).await
    }

    pub async fn get(&self, address: &Digest) -> Result<StoreEntry> {
        self.store.get(address).await
    }

    #[tracing::instrument(skip_all, fields(address = %address.short()))]
    pub async fn commit(
        &self,
        address: &Digest,
        artifact: Artifact,
        references: BTreeSet<Digest>,
    ) -> Result<StoreEntry> {
        artifact.validate()?;
        for reference in &references {
            if !self.store.has(reference).await? {
                return Err(Error::EntryNotFound(*reference));
            }
        }
        self.store.commit(address, artifact, references).await
    }

    pub async fn entries(&self) -> Result<Vec<StoreEntry>> {
        self.store.entries().await
    }

    pub async fn referrers(&self, address: &Digest) -> Result<BTreeSet<Digest>> {
        self.store.referrers(address).await
    }
}

/// Exclusive hold on one store address.
pub struct AddressGuard {
    guard: Option<OwnedMutexGuard<()>>,
    address: Digest,
    locks: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
}

impl Drop for AddressGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table itself still holds the mutex: nobody is waiting.
        self.locks
            .remove_if(&self.address, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
