// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Layered configuration.
//!
//! Values come from built-in defaults, then an optional YAML file
//! (`$XDG_CONFIG_HOME/envforge/config.yaml`), then `ENVFORGE_*` environment
//! variables, where `__` separates nested keys:
//!
//! ```text
//! ENVFORGE_STORE__ROOT=/mnt/envforge/store
//! ENVFORGE_REALIZE__CONCURRENCY=8
//! ENVFORGE_DISCOVERY__INCLUDES=/team/base.envforge.yaml,~/extra.envforge.yaml
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryOptions;
use crate::resolve::DEFAULT_MAX_RESTARTS;
use crate::store::StoreHandle;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "ENVFORGE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub resolve: ResolveConfig,
    pub realize: RealizeConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the on-disk store.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("envforge")
                .join("store"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolveConfig {
    pub max_restarts: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RealizeConfig {
    /// Nodes realized at the same time.
    pub concurrency: usize,
}

impl Default for RealizeConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::realize::default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Override the `inherit` flag of the starting manifest.
    pub inherit: Option<bool>,
    /// Manifests loaded before anything found in the tree.
    pub includes: Vec<String>,
}

impl Config {
    /// Default location of the user configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("envforge").join("config.yaml"))
    }

    /// Load from the default file and the process environment.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(Self::default_path().as_deref(), None)
    }

    /// Load from an optional file and an explicit environment.
    ///
    /// `env` replaces the process environment when given.
    pub fn load_from(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?);
        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "reading configuration file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(false),
            );
        }
        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("discovery.includes")
            .source(env);

        let config: Self = builder.add_source(environment).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.realize.concurrency == 0 {
            return Err(crate::Error::ValidationFailed(
                "realize.concurrency must be at least 1".to_string(),
            ));
        }
        if self.store.root.as_os_str().is_empty() {
            return Err(crate::Error::ValidationFailed(
                "store.root must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured on-disk store.
    pub fn open_store(&self) -> crate::Result<StoreHandle> {
        StoreHandle::open(&self.store.root)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            no_inherit: self.discovery.inherit == Some(false),
            force_inherit: self.discovery.inherit == Some(true),
            includes: self.discovery.includes.clone(),
        }
    }
}
