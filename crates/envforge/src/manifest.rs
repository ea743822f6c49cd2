// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Manifest parsing and data types for .envforge.yaml files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::environment::EnvOp;
use crate::request::PackageRequest;

#[cfg(test)]
#[path = "./manifest_test.rs"]
mod manifest_test;

/// API version for manifest files.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ApiVersion {
    #[default]
    #[serde(rename = "envforge/v0")]
    V0,
}

/// Helper for two-stage deserialization to determine API version first.
#[derive(Deserialize)]
struct ApiVersionMapping {
    #[serde(default)]
    api: ApiVersion,
}

/// Declared environment from a .envforge.yaml file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub api: ApiVersion,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// When false (default), discovery stops at this file instead of
    /// walking up the directory tree.
    #[serde(default)]
    pub inherit: bool,

    /// Out-of-tree manifests loaded before this one.
    /// Absolute, home-relative (~/) or relative to this file's directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,

    /// Root package requests, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageRequest>,

    /// Environment variable operations (set, prepend, append, comment, priority).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvOp>,

    /// Path to the file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Manifest {
    /// Parse a manifest from YAML.
    pub fn from_yaml<S: Into<String>>(yaml: S) -> crate::Result<Self> {
        let yaml = yaml.into();

        let value: serde_yaml::Value =
            serde_yaml::from_str(&yaml).map_err(|e| crate::Error::InvalidYaml {
                error: e,
                yaml_content: yaml.clone(),
            })?;

        let with_version: ApiVersionMapping =
            serde_yaml::from_value(value.clone()).map_err(|e| crate::Error::InvalidYaml {
                error: e,
                yaml_content: yaml.clone(),
            })?;

        match with_version.api {
            ApiVersion::V0 => {
                serde_yaml::from_value(value).map_err(|e| crate::Error::InvalidYaml {
                    error: e,
                    yaml_content: yaml,
                })
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| crate::Error::ReadFailed {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut manifest = Self::from_yaml(yaml)?;
        manifest.source_path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Validate a manifest after loading.
    pub fn validate(&self) -> crate::Result<()> {
        if self.source_path.is_none() {
            return Err(crate::Error::ValidationFailed(
                "source_path must be set".to_string(),
            ));
        }
        for include in &self.includes {
            if include.trim().is_empty() {
                return Err(crate::Error::ValidationFailed(
                    "includes must not contain empty paths".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolve includes to canonical paths.
    pub fn resolve_includes(&self) -> crate::Result<Vec<PathBuf>> {
        let base_dir = self
            .source_path
            .as_ref()
            .and_then(|p| p.parent())
            .ok_or_else(|| {
                crate::Error::ValidationFailed(
                    "Cannot resolve includes without source_path".to_string(),
                )
            })?;

        let mut resolved = Vec::with_capacity(self.includes.len());
        for include in &self.includes {
            let path = if let Some(rest) = include.strip_prefix('~') {
                let home = dirs::home_dir().ok_or_else(|| {
                    crate::Error::ValidationFailed("Cannot resolve ~ without HOME".to_string())
                })?;
                home.join(rest.trim_start_matches('/'))
            } else if Path::new(include).is_absolute() {
                PathBuf::from(include)
            } else {
                base_dir.join(include)
            };

            let canonical =
                dunce::canonicalize(&path).map_err(|e| crate::Error::IncludeNotFound {
                    path: path.clone(),
                    error: e,
                })?;
            resolved.push(canonical);
        }

        Ok(resolved)
    }
}

/// The merged result of several manifests.
#[derive(Debug, Clone, Default)]
pub struct ComposedManifest {
    /// Root requests in declaration order across all manifests.
    pub packages: Vec<PackageRequest>,

    /// Environment operations in application order.
    pub environment: Vec<EnvOp>,

    /// Files that contributed, in composition order.
    pub source_files: Vec<PathBuf>,
}

impl ComposedManifest {
    pub fn source_count(&self) -> usize {
        self.source_files.len()
    }
}

/// Merge manifests in order; later manifests layer on top of earlier ones.
pub fn compose_manifests(manifests: &[Manifest]) -> ComposedManifest {
    let mut composed = ComposedManifest::default();

    for manifest in manifests {
        composed.packages.extend(manifest.packages.iter().cloned());
        composed
            .environment
            .extend(manifest.environment.iter().cloned());
        if let Some(path) = &manifest.source_path {
            composed.source_files.push(path.clone());
        }
    }

    composed
}
