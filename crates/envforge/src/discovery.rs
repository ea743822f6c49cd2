// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Discovery of .envforge.yaml manifests in the directory tree.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[cfg(test)]
#[path = "./discovery_test.rs"]
mod discovery_test;

use crate::manifest::Manifest;
use crate::{ENVFORGE_FILENAME, ENVFORGE_LOCAL_FILENAME};

/// Options for discovery behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Never walk up the tree, and require a manifest at the start path.
    pub no_inherit: bool,

    /// Walk up the tree even when the starting manifest says otherwise.
    pub force_inherit: bool,

    /// Manifests loaded before anything found in the tree. Relative paths
    /// are resolved against the start path.
    pub includes: Vec<String>,
}

/// Tracks include chains for one discovery pass.
#[derive(Debug, Default)]
struct IncludeTracker {
    /// Manifests whose includes are being expanded.
    active: Vec<PathBuf>,
    /// Manifests already emitted.
    loaded: HashSet<PathBuf>,
}

/// Discover all applicable manifests under `start_path`.
///
/// Returns manifests in composition order (earlier manifests are layered
/// first). A manifest reachable through several includes appears once, at
/// its first position.
#[tracing::instrument(skip(start_path, options), fields(start = %start_path.as_ref().display()))]
pub fn discover_manifests<P: AsRef<Path>>(
    start_path: P,
    options: &DiscoveryOptions,
) -> crate::Result<Vec<Manifest>> {
    let start = resolve_start_path(start_path.as_ref());
    let mut manifests = Vec::new();

    for include in &options.includes {
        let path = resolve_include_path(include, Some(&start))?;
        manifests.push(Manifest::load(&path)?);
    }

    manifests.extend(discover_in_tree(&start, options)?);

    let mut tracker = IncludeTracker::default();
    let mut all = resolve_all_includes(manifests, &mut tracker)?;

    let local_path = start.join(ENVFORGE_LOCAL_FILENAME);
    if local_path.is_file() {
        tracing::debug!(path = %local_path.display(), "applying local override");
        all.push(Manifest::load(&local_path)?);
    }

    for manifest in &all {
        manifest.validate()?;
    }
    tracing::debug!(manifests = all.len(), "discovered manifests");
    Ok(all)
}

/// Resolve the starting path, preferring $PWD to preserve symlinks.
fn resolve_start_path(start_path: &Path) -> PathBuf {
    if start_path.is_absolute() {
        return start_path.to_owned();
    }
    match std::env::var("PWD").ok() {
        Some(pwd) => PathBuf::from(pwd).join(start_path),
        None => std::env::current_dir()
            .unwrap_or_default()
            .join(start_path),
    }
}

/// Find manifests at `start` and, when inheriting, in its parents.
fn discover_in_tree(start: &Path, options: &DiscoveryOptions) -> crate::Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    let mut current = start.to_path_buf();

    let start_manifest = current.join(ENVFORGE_FILENAME);
    if start_manifest.is_file() {
        let manifest = Manifest::load(&start_manifest)?;
        let inherit = if options.force_inherit {
            true
        } else if options.no_inherit {
            false
        } else {
            manifest.inherit
        };
        manifests.push(manifest);
        if !inherit {
            return Ok(manifests);
        }
    } else if options.no_inherit {
        return Err(crate::Error::NotFoundAtPath(current));
    }

    while current.pop() {
        let path = current.join(ENVFORGE_FILENAME);
        if !path.is_file() {
            continue;
        }
        let manifest = Manifest::load(&path)?;
        let inherit = manifest.inherit;
        // Parents go first.
        manifests.insert(0, manifest);
        if !inherit {
            break;
        }
    }

    if manifests.is_empty() && options.includes.is_empty() {
        return Err(crate::Error::NotFoundInTree(start.to_path_buf()));
    }
    Ok(manifests)
}

/// Resolve an include to an absolute canonical path.
fn resolve_include_path(include: &str, base_dir: Option<&Path>) -> crate::Result<PathBuf> {
    let path = if let Some(rest) = include.strip_prefix('~') {
        let home = dirs::home_dir().ok_or_else(|| {
            crate::Error::ValidationFailed("Cannot resolve ~ without HOME".to_string())
        })?;
        home.join(rest.trim_start_matches('/'))
    } else if Path::new(include).is_absolute() {
        PathBuf::from(include)
    } else {
        let base = base_dir.ok_or_else(|| {
            crate::Error::ValidationFailed(format!(
                "Cannot resolve relative include '{include}' without base directory"
            ))
        })?;
        base.join(include)
    };

    dunce::canonicalize(&path).map_err(|e| crate::Error::IncludeNotFound {
        path: path.clone(),
        error: e,
    })
}

fn resolve_all_includes(
    manifests: Vec<Manifest>,
    tracker: &mut IncludeTracker,
) -> crate::Result<Vec<Manifest>> {
    let mut result = Vec::new();
    for manifest in manifests {
        expand(manifest, tracker, &mut result)?;
    }
    Ok(result)
}

/// Emit the includes of `manifest` (recursively) and then `manifest` itself.
fn expand(
    manifest: Manifest,
    tracker: &mut IncludeTracker,
    result: &mut Vec<Manifest>,
) -> crate::Result<()> {
    let key = manifest
        .source_path
        .as_deref()
        .map(|p| dunce::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()));

    if let Some(key) = &key {
        if tracker.active.contains(key) {
            return Err(crate::Error::CircularInclude(key.clone()));
        }
        if tracker.loaded.contains(key) {
            tracing::debug!(path = %key.display(), "manifest already included");
            return Ok(());
        }
        tracker.active.push(key.clone());
    }

    let base_dir = manifest
        .source_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    for include in &manifest.includes {
        let path = resolve_include_path(include, base_dir.as_deref())?;
        expand(Manifest::load(&path)?, tracker, result)?;
    }

    if let Some(key) = key {
        tracker.active.pop();
        tracker.loaded.insert(key);
    }
    result.push(manifest);
    Ok(())
}
