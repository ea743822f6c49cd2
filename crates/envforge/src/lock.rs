// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Lock file structures and helpers.
//!
//! A lock records the manifests an environment was composed from and the
//! exact versions and descriptors it resolved to. Feeding [`LockFile::pins`]
//! back into the resolver reproduces the same selection while it remains
//! compatible with the manifests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;
use crate::graph::ResolutionGraph;
use crate::manifest::ComposedManifest;

#[cfg(test)]
#[path = "./lock_test.rs"]
mod lock_test;

/// Lock file API version.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum LockApiVersion {
    #[serde(rename = "envforge/v0/lock")]
    V0,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockFile {
    pub api: LockApiVersion,
    pub generated: GenerationMetadata,
    pub sources: Vec<SourceFile>,
    /// Resolved packages in topological order.
    pub packages: Vec<LockedPackage>,
}

/// Metadata about when and where the lock was generated.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GenerationMetadata {
    pub timestamp: DateTime<Utc>,
    pub envforge_version: String,
    pub hostname: String,
}

/// Manifest file tracked by the lock.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub sha256: String,
    pub mtime: DateTime<Utc>,
}

/// One resolved package.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockedPackage {
    pub name: String,
    pub version: Version,
    pub descriptor: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl LockFile {
    pub fn from_yaml<S: Into<String>>(yaml: S) -> crate::Result<Self> {
        let yaml = yaml.into();
        serde_yaml::from_str(&yaml).map_err(|e| crate::Error::InvalidYaml {
            error: e,
            yaml_content: yaml,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| crate::Error::ReadFailed {
            path: path.to_path_buf(),
            error: e,
        })?;
        Self::from_yaml(yaml)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            crate::Error::ValidationFailed(format!("Failed to serialize lock file: {e}"))
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Versions to prefer during resolution.
    pub fn pins(&self) -> HashMap<String, Version> {
        self.packages
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect()
    }
}

/// Generate a lock from the composed manifests and their resolution.
pub fn generate_lock(composed: &ComposedManifest, graph: &ResolutionGraph) -> crate::Result<LockFile> {
    let mut sources = Vec::with_capacity(composed.source_files.len());
    for path in &composed.source_files {
        sources.push(SourceFile {
            path: path.clone(),
            sha256: hash_file(path)?,
            mtime: modified_time(path)?,
        });
    }

    Ok(LockFile {
        api: LockApiVersion::V0,
        generated: GenerationMetadata {
            timestamp: Utc::now(),
            envforge_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        },
        sources,
        packages: locked_packages(graph),
    })
}

/// Compare a lock against the current manifests and resolution.
pub fn verify_lock(
    lock: &LockFile,
    composed: &ComposedManifest,
    graph: &ResolutionGraph,
) -> crate::Result<Vec<LockChange>> {
    let mut changes = Vec::new();

    for source in &lock.sources {
        let reference = source.path.display().to_string();
        if !composed.source_files.contains(&source.path) {
            changes.push(LockChange {
                kind: LockChangeKind::SourceFileRemoved,
                reference,
                expected: Some(source.sha256.clone()),
                actual: None,
            });
            continue;
        }
        let actual = hash_file(&source.path)?;
        if actual != source.sha256 {
            changes.push(LockChange {
                kind: LockChangeKind::SourceFileChanged,
                reference,
                expected: Some(source.sha256.clone()),
                actual: Some(actual),
            });
        }
    }
    for path in &composed.source_files {
        if !lock.sources.iter().any(|s| &s.path == path) {
            changes.push(LockChange {
                kind: LockChangeKind::SourceFileAdded,
                reference: path.display().to_string(),
                expected: None,
                actual: Some(hash_file(path)?),
            });
        }
    }

    let current: BTreeMap<String, LockedPackage> = locked_packages(graph)
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();
    for locked in &lock.packages {
        let Some(actual) = current.get(&locked.name) else {
            changes.push(LockChange {
                kind: LockChangeKind::PackageRemoved,
                reference: locked.name.clone(),
                expected: Some(locked.version.to_string()),
                actual: None,
            });
            continue;
        };
        if actual.version != locked.version {
            changes.push(LockChange {
                kind: LockChangeKind::PackageVersionChanged,
                reference: locked.name.clone(),
                expected: Some(locked.version.to_string()),
                actual: Some(actual.version.to_string()),
            });
        } else if actual.descriptor != locked.descriptor {
            changes.push(LockChange {
                kind: LockChangeKind::PackageDescriptorChanged,
                reference: locked.name.clone(),
                expected: Some(locked.descriptor.to_string()),
                actual: Some(actual.descriptor.to_string()),
            });
        }
    }
    for (name, actual) in &current {
        if !lock.packages.iter().any(|p| &p.name == name) {
            changes.push(LockChange {
                kind: LockChangeKind::PackageAdded,
                reference: name.clone(),
                expected: None,
                actual: Some(actual.version.to_string()),
            });
        }
    }

    if !changes.is_empty() {
        tracing::debug!(changes = changes.len(), "lock file is out of date");
    }
    Ok(changes)
}

/// A single detected change between lock and current environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub kind: LockChangeKind,
    pub reference: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Types of lock mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChangeKind {
    SourceFileChanged,
    SourceFileAdded,
    SourceFileRemoved,
    PackageVersionChanged,
    /// Same version, different build inputs or dependency closure.
    PackageDescriptorChanged,
    PackageAdded,
    PackageRemoved,
}

fn locked_packages(graph: &ResolutionGraph) -> Vec<LockedPackage> {
    graph
        .iter()
        .map(|(_, node)| LockedPackage {
            name: node.ident.name.clone(),
            version: node.ident.version.clone(),
            descriptor: node.descriptor,
            dependencies: node
                .dependencies
                .iter()
                .map(|id| graph.node(*id).ident.name.clone())
                .collect(),
        })
        .collect()
}

fn hash_file(path: &Path) -> crate::Result<String> {
    let content = std::fs::read(path).map_err(|e| crate::Error::ReadFailed {
        path: path.to_path_buf(),
        error: e,
    })?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

fn modified_time(path: &Path) -> crate::Result<DateTime<Utc>> {
    let metadata = std::fs::metadata(path)?;
    Ok(metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
        .unwrap_or_else(Utc::now))
}
