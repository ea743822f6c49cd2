// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! envforge - Reproducible Environments from Package Graphs
//!
//! This crate turns a declarative list of package requests into an isolated,
//! reproducible environment in three steps:
//!
//! 1. **Resolve** the requests against a [`PackageRepository`] into an
//!    acyclic [`ResolutionGraph`] with exactly one version per package.
//! 2. **Realize** every node into a content-addressed [`store`], invoking an
//!    external [`BuildAction`] only for addresses not already committed.
//! 3. **Compose** the realized entries into an [`EnvironmentDescriptor`] of
//!    search paths and variables.
//!
//! Requests are declared in `.envforge.yaml` manifests, discovered in the
//! directory tree and composed with their includes.
//!
//! # Example
//!
//! ```yaml
//! # .envforge.yaml
//! api: envforge/v0
//! description: "Build tools for the project"
//!
//! # don't walk up the directory tree (default)
//! inherit: false
//!
//! includes:
//!   - ~/.config/envforge/defaults.envforge.yaml
//!
//! packages:
//!   - python@>=3.11, <4
//!   - cmake
//!   - zlib ^1.3
//!
//! environment:
//!   - set: CC
//!     value: clang
//! ```

pub mod compose;
pub mod config;
pub mod digest;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod graph;
pub mod lock;
pub mod manifest;
pub mod realize;
pub mod repository;
pub mod request;
pub mod resolve;
pub mod runtime;
pub mod store;

pub use compose::{Composer, SearchPathRule, compose};
pub use digest::Digest;
pub use discovery::{DiscoveryOptions, discover_manifests};
pub use environment::{EnvOp, EnvironmentDescriptor, generate_startup_script};
pub use error::{Error, Result};
pub use graph::{NodeId, PackageIdent, PackageNode, ResolutionGraph};
pub use lock::{LockChange, LockChangeKind, LockFile, generate_lock, verify_lock};
pub use manifest::{ApiVersion, ComposedManifest, Manifest, compose_manifests};
pub use realize::{BuildAction, Realization, Realizer};
pub use repository::{BuildInputs, MemoryRepository, PackageRepository, RepositoryIndex};
pub use request::PackageRequest;
pub use resolve::Resolver;
pub use runtime::{Cancellation, Environment, RuntimeOptions, create_environment};
pub use store::{Artifact, Store, StoreEntry, StoreHandle};

/// Well-known filename for manifests.
pub const ENVFORGE_FILENAME: &str = ".envforge.yaml";

/// Well-known filename for local overrides.
pub const ENVFORGE_LOCAL_FILENAME: &str = ".envforge.local.yaml";

/// Well-known filename for lock files.
pub const ENVFORGE_LOCK_FILENAME: &str = ".envforge.lock.yaml";
