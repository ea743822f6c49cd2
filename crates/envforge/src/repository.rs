// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Package repositories: the read-only source of versions and dependencies.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, DigestBuilder};
use crate::request::PackageRequest;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./repository_test.rs"]
mod repository_test;

/// Query interface over a package database.
///
/// Implementations must be pure with respect to their inputs: the resolver
/// may ask the same question several times while backtracking.
#[async_trait]
pub trait PackageRepository: Send + Sync {
    /// Available versions of `name`, in ascending order.
    async fn list_versions(&self, name: &str) -> Result<Vec<Version>>;

    /// Dependency requests of one version, in declaration order.
    async fn list_dependencies(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Vec<PackageRequest>>;

    /// Build-relevant inputs of one version.
    async fn build_inputs(&self, name: &str, version: &Version) -> Result<BuildInputs> {
        Ok(BuildInputs::for_ident(name, version))
    }
}

/// Everything that influences the content of a built package, apart from its
/// dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildInputs {
    /// Source identifiers (urls, archive digests, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Compiler and configure flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,

    /// Build environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl BuildInputs {
    /// Inputs for a package with no declared sources: identified by name and version.
    pub fn for_ident(name: &str, version: &Version) -> Self {
        Self {
            sources: vec![format!("{name}-{version}")],
            ..Default::default()
        }
    }

    /// Content descriptor for these inputs on top of the given dependencies.
    ///
    /// Only build-relevant data is hashed. Dependency descriptors are hashed
    /// in declaration order.
    pub fn descriptor(&self, dependencies: &[Digest]) -> Digest {
        let mut hasher = DigestBuilder::new("envforge/node/v0");
        hasher.write_strs(self.sources.iter().map(String::as_str));
        hasher.write_strs(self.flags.iter().map(String::as_str));
        hasher.write_count(self.env.len());
        for (key, value) in &self.env {
            hasher.write_str(key).write_str(value);
        }
        hasher.write_count(dependencies.len());
        for dep in dependencies {
            hasher.write_digest(dep);
        }
        hasher.finish()
    }
}

/// Index file API version.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum IndexApiVersion {
    #[serde(rename = "envforge/v0/index")]
    #[default]
    V0,
}

/// One version entry of a repository index file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexedVersion {
    pub version: Version,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PackageRequest>,

    /// Explicit build inputs; derived from name and version when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BuildInputs>,
}

/// A repository index file (`api: envforge/v0/index`).
///
/// ```yaml
/// api: envforge/v0/index
/// packages:
///   zlib:
///     - version: 1.3.1
///   python:
///     - version: 3.12.2
///       dependencies: [zlib@^1]
///       inputs:
///         sources:
///           - https://python.org/ftp/python/3.12.2/Python-3.12.2.tgz
///         flags:
///           - --enable-optimizations
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositoryIndex {
    #[serde(default)]
    pub api: IndexApiVersion,
    #[serde(default)]
    pub packages: BTreeMap<String, Vec<IndexedVersion>>,
}

impl RepositoryIndex {
    pub fn from_yaml<S: Into<String>>(yaml: S) -> Result<Self> {
        let yaml = yaml.into();
        serde_yaml::from_str(&yaml).map_err(|error| Error::InvalidYaml {
            error,
            yaml_content: yaml,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|error| Error::ReadFailed {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_yaml(yaml)
    }
}

#[derive(Debug, Clone, Default)]
struct PackageDefinition {
    dependencies: Vec<PackageRequest>,
    inputs: Option<BuildInputs>,
}

/// In-memory repository, usable directly in tests or loaded from an index file.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    packages: HashMap<String, BTreeMap<Version, PackageDefinition>>,
    queries: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_index(index: RepositoryIndex) -> Self {
        let mut repo = Self::new();
        for (name, versions) in index.packages {
            for entry in versions {
                repo.insert(&name, entry.version, entry.dependencies, entry.inputs);
            }
        }
        repo
    }

    /// Load a repository from a YAML index file.
    pub fn load_index<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_index(RepositoryIndex::load(path)?))
    }

    /// Add a package version with textual dependency requests.
    pub fn add(&mut self, name: &str, version: &str, dependencies: &[&str]) -> Result<()> {
        let version = Version::parse(version).map_err(|e| Error::InvalidRequest {
            request: format!("{name}@{version}"),
            reason: e.to_string(),
        })?;
        let dependencies = dependencies
            .iter()
            .map(|d| d.parse())
            .collect::<Result<Vec<PackageRequest>>>()?;
        self.insert(name, version, dependencies, None);
        Ok(())
    }

    /// Override the build inputs of an already added version.
    pub fn set_inputs(&mut self, name: &str, version: &Version, inputs: BuildInputs) -> Result<()> {
        let definition = self
            .packages
            .get_mut(name)
            .and_then(|versions| versions.get_mut(version))
            .ok_or_else(|| Error::UnknownPackage {
                name: format!("{name}/{version}"),
                similar: Vec::new(),
            })?;
        definition.inputs = Some(inputs);
        Ok(())
    }

    pub fn insert(
        &mut self,
        name: &str,
        version: Version,
        dependencies: Vec<PackageRequest>,
        inputs: Option<BuildInputs>,
    ) {
        self.packages.entry(name.to_string()).or_default().insert(
            version,
            PackageDefinition {
                dependencies,
                inputs,
            },
        );
    }

    /// Number of queries answered so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    fn definition(&self, name: &str, version: &Version) -> Result<&PackageDefinition> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.versions_of(name)?
            .get(version)
            .ok_or_else(|| Error::UnknownPackage {
                name: format!("{name}/{version}"),
                similar: Vec::new(),
            })
    }

    fn versions_of(&self, name: &str) -> Result<&BTreeMap<Version, PackageDefinition>> {
        self.packages.get(name).ok_or_else(|| Error::UnknownPackage {
            name: name.to_string(),
            similar: self.similar_names(name),
        })
    }

    fn similar_names(&self, name: &str) -> Vec<String> {
        let needle = name.to_lowercase();
        let mut similar: Vec<String> = self
            .packages
            .keys()
            .filter(|candidate| {
                let candidate = candidate.to_lowercase();
                candidate.contains(&needle) || needle.contains(&candidate)
            })
            .cloned()
            .collect();
        similar.sort();
        similar
    }
}

#[async_trait]
impl PackageRepository for MemoryRepository {
    async fn list_versions(&self, name: &str) -> Result<Vec<Version>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.versions_of(name)?.keys().cloned().collect())
    }

    async fn list_dependencies(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Vec<PackageRequest>> {
        Ok(self.definition(name, version)?.dependencies.clone())
    }

    async fn build_inputs(&self, name: &str, version: &Version) -> Result<BuildInputs> {
        Ok(self
            .definition(name, version)?
            .inputs
            .clone()
            .unwrap_or_else(|| BuildInputs::for_ident(name, version)))
    }
}
