// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for envforge operations.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::digest::Digest;
use crate::graph::PackageIdent;

/// Convenience Result type with envforge Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by external collaborators (repositories, build actions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during envforge operations.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// No version of a package satisfies the active constraints
    #[error("No version of '{name}' satisfies: {}", constraints.join(", "))]
    #[diagnostic(
        code(envforge::unsatisfiable_constraint),
        help("Relax one of the conflicting version constraints")
    )]
    UnsatisfiableConstraint {
        name: String,
        constraints: Vec<String>,
    },

    /// A package depends on itself, directly or transitively
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    #[diagnostic(
        code(envforge::cycle_detected),
        help("Break the cycle in the package repository definitions")
    )]
    CycleDetected { cycle: Vec<String> },

    /// The same address was committed twice with different content
    #[error("Content mismatch for store address {address}: expected {expected}, found {actual}")]
    #[diagnostic(
        code(envforge::content_mismatch),
        help("The build for this address is not deterministic")
    )]
    ContentMismatch {
        address: Digest,
        expected: Digest,
        actual: Digest,
    },

    /// The external build/fetch action failed for a node
    #[error("Failed to realize {node}")]
    #[diagnostic(code(envforge::realization_failed))]
    RealizationFailed {
        node: PackageIdent,
        #[source]
        source: BoxError,
    },

    /// A graph node has no realized store entry
    #[error("{node} has not been realized")]
    #[diagnostic(
        code(envforge::incomplete_realization),
        help("Realize the full resolution graph before composing an environment")
    )]
    IncompleteRealization { node: PackageIdent },

    /// Store I/O failed for an address
    #[error("Store I/O failed for {address}")]
    #[diagnostic(code(envforge::store_io))]
    StoreIo {
        address: Digest,
        #[source]
        source: std::io::Error,
    },

    /// No entry exists at the given address
    #[error("No store entry at {0}")]
    #[diagnostic(code(envforge::entry_not_found))]
    EntryNotFound(Digest),

    /// The resolution graph violated an internal invariant
    #[error("Invalid resolution graph: {0}")]
    #[diagnostic(code(envforge::invalid_graph))]
    InvalidGraph(String),

    /// The operation was cancelled between nodes
    #[error("Operation cancelled")]
    #[diagnostic(code(envforge::cancelled))]
    Cancelled,

    /// Package not known to the repository
    #[error("Unknown package: {name}")]
    #[diagnostic(
        code(envforge::unknown_package),
        help("{}", suggestion_message(similar))
    )]
    UnknownPackage { name: String, similar: Vec<String> },

    /// Malformed package request
    #[error("Invalid package request '{request}': {reason}")]
    #[diagnostic(
        code(envforge::invalid_request),
        help("Use 'name', 'name@<version req>' or 'name <version req>'")
    )]
    InvalidRequest { request: String, reason: String },

    /// No manifest found in directory tree
    #[error("No .envforge.yaml found in {0:?} or any parent directory")]
    #[diagnostic(
        code(envforge::not_found_in_tree),
        help("Create a .envforge.yaml file or specify a path explicitly")
    )]
    NotFoundInTree(PathBuf),

    /// Manifest not found at specified path
    #[error(".envforge.yaml not found at {0:?}")]
    #[diagnostic(code(envforge::not_found_at_path))]
    NotFoundAtPath(PathBuf),

    /// Invalid YAML in a manifest, lock or index file
    #[error("Invalid YAML: {error}")]
    #[diagnostic(
        code(envforge::invalid_yaml),
        help("Check YAML syntax and ensure the 'api' field is correct")
    )]
    InvalidYaml {
        #[source]
        error: serde_yaml::Error,
        yaml_content: String,
    },

    /// Failed to read file
    #[error("Failed to read file: {path:?}")]
    #[diagnostic(code(envforge::read_failed))]
    ReadFailed {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Include file not found
    #[error("Include file not found: {path:?}")]
    #[diagnostic(
        code(envforge::include_not_found),
        help("Check that the include path is correct and the file exists")
    )]
    IncludeNotFound {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Circular include detected
    #[error("Circular include detected: {0:?}")]
    #[diagnostic(
        code(envforge::circular_include),
        help("Remove the circular reference in your includes")
    )]
    CircularInclude(PathBuf),

    /// Validation error
    #[error("Validation failed: {0}")]
    #[diagnostic(code(envforge::validation_failed))]
    ValidationFailed(String),

    /// Configuration could not be loaded
    #[error("Invalid configuration")]
    #[diagnostic(code(envforge::config))]
    Config(#[from] config::ConfigError),

    /// IO error passthrough
    #[error(transparent)]
    #[diagnostic(code(envforge::io_error))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors a caller may reasonably retry.
    ///
    /// Structural failures (resolution, composition, determinism) are never
    /// retryable; realization and store I/O failures may be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RealizationFailed { .. } | Self::StoreIo { .. })
    }
}

fn suggestion_message(similar: &[String]) -> String {
    if similar.is_empty() {
        "Check that the package name is correct".to_string()
    } else {
        format!("Did you mean one of: {}?", similar.join(", "))
    }
}
