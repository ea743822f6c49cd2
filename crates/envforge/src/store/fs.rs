// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Artifact, Store, StoreEntry};
use crate::digest::Digest;
use crate::{Error, Result};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const ENTRY_FILENAME: &str = "entry.yaml";
const DATA_DIR: &str = "data";

/// Store persisted on the local filesystem.
///
/// Layout:
///
/// ```text
/// <root>/objects/<2 chars>/<rest of address>/entry.yaml
/// <root>/objects/<2 chars>/<rest of address>/data/...
/// <root>/tmp/
/// ```
///
/// An entry is staged under `tmp` and renamed into `objects` in one step, so
/// other processes sharing the root see either nothing or the whole entry.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root.join(OBJECTS_DIR))?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        let root = dunce::canonicalize(root)?;
        tracing::debug!(root = %root.display(), "opened store");
        Ok(Self { root })
    }

    fn entry_dir(&self, address: &Digest) -> PathBuf {
        let text = address.to_string();
        let (shard, rest) = text.split_at(2);
        self.root.join(OBJECTS_DIR).join(shard).join(rest)
    }

    fn read_entry(&self, address: &Digest) -> Result<Option<StoreEntry>> {
        let path = self.entry_dir(address).join(ENTRY_FILENAME);
        let yaml = match std::fs::read_to_string(&path) {
            Ok(yaml) => yaml,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::StoreIo {
                    address: *address,
                    source,
                });
            }
        };
        serde_yaml::from_str(&yaml)
            .map(Some)
            .map_err(|error| Error::InvalidYaml {
                error,
                yaml_content: yaml,
            })
    }

    fn commit_blocking(
        &self,
        address: &Digest,
        artifact: &Artifact,
        references: BTreeSet<Digest>,
    ) -> Result<StoreEntry> {
        if let Some(existing) = self.read_entry(address)? {
            existing.ensure_same_content(artifact)?;
            tracing::debug!(address = %address.short(), "entry already committed");
            return Ok(existing);
        }

        let io_err = |source: std::io::Error| Error::StoreIo {
            address: *address,
            source,
        };

        let final_dir = self.entry_dir(address);
        let staging = tempfile::TempDir::new_in(self.root.join(TMP_DIR)).map_err(io_err)?;
        let data_dir = staging.path().join(DATA_DIR);
        std::fs::create_dir_all(&data_dir).map_err(io_err)?;
        for (relative, content) in &artifact.files {
            let target = data_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::write(&target, content).map_err(io_err)?;
        }

        let entry = StoreEntry::new(*address, final_dir.join(DATA_DIR), artifact, references);
        let yaml = serde_yaml::to_string(&entry).map_err(|e| {
            Error::ValidationFailed(format!("Failed to serialize store entry {address}: {e}"))
        })?;
        let mut meta =
            std::fs::File::create(staging.path().join(ENTRY_FILENAME)).map_err(io_err)?;
        meta.write_all(yaml.as_bytes()).map_err(io_err)?;
        meta.sync_all().map_err(io_err)?;

        if let Some(parent) = final_dir.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let staged = staging.keep();
        if let Err(err) = std::fs::rename(&staged, &final_dir) {
            let _ = std::fs::remove_dir_all(&staged);
            // Another writer committed this address first.
            if let Some(existing) = self.read_entry(address)? {
                existing.ensure_same_content(artifact)?;
                return Ok(existing);
            }
            return Err(io_err(err));
        }

        tracing::debug!(address = %address.short(), path = %final_dir.display(), "committed entry");
        Ok(entry)
    }
}

#[async_trait]
impl Store for FsStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn has(&self, address: &Digest) -> Result<bool> {
        let path = self.entry_dir(address).join(ENTRY_FILENAME);
        tokio::task::spawn_blocking(move || path.is_file())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    async fn get(&self, address: &Digest) -> Result<StoreEntry> {
        let store = self.clone();
        let address = *address;
        tokio::task::spawn_blocking(move || store.read_entry(&address))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??
            .ok_or(Error::EntryNotFound(address))
    }

    async fn commit(
        &self,
        address: &Digest,
        artifact: Artifact,
        references: BTreeSet<Digest>,
    ) -> Result<StoreEntry> {
        let store = self.clone();
        let address = *address;
        tokio::task::spawn_blocking(move || store.commit_blocking(&address, &artifact, references))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn entries(&self) -> Result<Vec<StoreEntry>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

impl FsStore {
    fn list_blocking(&self) -> Result<Vec<StoreEntry>> {
        let mut entries = Vec::new();
        for shard in std::fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for item in std::fs::read_dir(shard.path())? {
                let item = item?;
                let name = format!("{prefix}{}", item.file_name().to_string_lossy());
                let Ok(address) = name.parse::<Digest>() else {
                    tracing::warn!(path = %item.path().display(), "ignoring unexpected store object");
                    continue;
                };
                if let Some(entry) = self.read_entry(&address)? {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|e| e.address);
        Ok(entries)
    }
}
