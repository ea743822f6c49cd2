// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Package requests as declared in manifests.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./request_test.rs"]
mod request_test;

/// A package name plus an optional version constraint.
///
/// Accepted forms are `name`, `name@<req>` and `name <req>`, where `<req>`
/// is any semver requirement (`^1.2`, `>=3.11, <4`, `=2.0.1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRequest {
    pub name: String,
    pub constraint: Option<VersionReq>,
}

impl PackageRequest {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn with_constraint<S: Into<String>>(name: S, constraint: VersionReq) -> Self {
        Self {
            name: name.into(),
            constraint: Some(constraint),
        }
    }

    /// Request exactly one version.
    pub fn exact<S: Into<String>>(name: S, version: &Version) -> Self {
        let req = VersionReq {
            comparators: vec![semver::Comparator {
                op: semver::Op::Exact,
                major: version.major,
                minor: Some(version.minor),
                patch: Some(version.patch),
                pre: version.pre.clone(),
            }],
        };
        Self::with_constraint(name, req)
    }

    /// True if `version` satisfies this request's constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.constraint
            .as_ref()
            .is_none_or(|req| req.matches(version))
    }

    /// Human readable form of the constraint, `*` when unconstrained.
    pub fn constraint_string(&self) -> String {
        self.constraint
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "*".to_string())
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(req) => write!(f, "{}@{}", self.name, req),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for PackageRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let invalid = |reason: &str| Error::InvalidRequest {
            request: s.to_string(),
            reason: reason.to_string(),
        };

        let (name, req) = match trimmed.find(|c: char| c == '@' || c.is_whitespace()) {
            Some(idx) => (&trimmed[..idx], Some(trimmed[idx + 1..].trim())),
            None => (trimmed, None),
        };

        if name.is_empty() {
            return Err(invalid("missing package name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
        {
            return Err(invalid("package names may only contain [A-Za-z0-9-_.+]"));
        }

        let constraint = match req {
            None => None,
            Some("") => return Err(invalid("empty version constraint")),
            Some(req) => Some(
                VersionReq::parse(req).map_err(|e| invalid(&e.to_string()))?,
            ),
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
        })
    }
}

impl Serialize for PackageRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PackageRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
