// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Artifact, Store, StoreEntry};
use crate::digest::Digest;
use crate::{Error, Result};

/// Default virtual root for in-memory stores.
pub const MEMORY_STORE_ROOT: &str = "/envforge/store";

/// Store that keeps entries and artifacts in memory.
#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    entries: DashMap<Digest, (StoreEntry, Artifact)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_root(MEMORY_STORE_ROOT)
    }
}

impl MemoryStore {
    /// Create a store whose entry paths are reported under `root`.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            entries: DashMap::new(),
        }
    }

    /// The committed artifact at `address`.
    pub fn artifact(&self, address: &Digest) -> Option<Artifact> {
        self.entries.get(address).map(|e| e.value().1.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn has(&self, address: &Digest) -> Result<bool> {
        Ok(self.entries.contains_key(address))
    }

    async fn get(&self, address: &Digest) -> Result<StoreEntry> {
        self.entries
            .get(address)
            .map(|e| e.value().0.clone())
            .ok_or(Error::EntryNotFound(*address))
    }

    async fn commit(
        &self,
        address: &Digest,
        artifact: Artifact,
        references: BTreeSet<Digest>,
    ) -> Result<StoreEntry> {
        match self.entries.entry(*address) {
            Entry::Occupied(existing) => {
                let (entry, _) = existing.get();
                entry.ensure_same_content(&artifact)?;
                tracing::debug!(address = %address.short(), "entry already committed");
                Ok(entry.clone())
            }
            Entry::Vacant(slot) => {
                let path = self.root.join(address.to_string());
                let entry = StoreEntry::new(*address, path, &artifact, references);
                slot.insert((entry.clone(), artifact));
                Ok(entry)
            }
        }
    }

    async fn entries(&self) -> Result<Vec<StoreEntry>> {
        let mut entries: Vec<StoreEntry> = self.entries.iter().map(|e| e.value().0.clone()).collect();
        entries.sort_by_key(|e| e.address);
        Ok(entries)
    }
}
