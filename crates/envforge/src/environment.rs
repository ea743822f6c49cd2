// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable operations and the composed environment descriptor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

#[cfg(test)]
#[path = "./environment_test.rs"]
mod environment_test;

/// Separator used for search path variables.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Startup script priority when none is given.
pub const DEFAULT_PRIORITY: u8 = 50;

/// One `environment:` entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvOp {
    Set(SetEnv),
    Prepend(PrependEnv),
    Append(AppendEnv),
    Comment(CommentEnv),
    Priority(PriorityEnv),
}

/// `set: NAME` / `value: ...`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SetEnv {
    pub set: String,
    pub value: String,
}

/// `prepend: NAME` / `value: ...`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrependEnv {
    pub prepend: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

/// `append: NAME` / `value: ...`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppendEnv {
    pub append: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

/// A comment carried into the startup script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommentEnv {
    pub comment: String,
}

/// Ordering hint for the startup script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PriorityEnv {
    pub priority: u8,
}

/// The last priority given, or [`DEFAULT_PRIORITY`].
pub fn get_priority(ops: &[EnvOp]) -> u8 {
    ops.iter()
        .rev()
        .find_map(|op| match op {
            EnvOp::Priority(p) => Some(p.priority),
            _ => None,
        })
        .unwrap_or(DEFAULT_PRIORITY)
}

/// The complete, isolated environment of a realized resolution.
///
/// Nothing here refers to the host environment: search paths hold only store
/// locations and variables hold only explicitly bound values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentDescriptor {
    /// Store addresses that contributed, in composition order.
    pub contributors: Vec<Digest>,

    /// Search path variable to ordered entries.
    #[serde(default)]
    pub search_paths: BTreeMap<String, Vec<String>>,

    /// Plain variable bindings.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Comments to carry into a rendered script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
}

impl EnvironmentDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a variable as the shell would see it.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        self.search_paths
            .get(name)
            .map(|paths| paths.join(DEFAULT_SEPARATOR))
    }

    /// Flatten into `NAME -> value` pairs.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .search_paths
            .iter()
            .map(|(name, paths)| (name.clone(), paths.join(DEFAULT_SEPARATOR)))
            .collect();
        env.extend(self.variables.clone());
        env
    }

    /// Apply manifest environment operations on top of the composed paths.
    pub fn apply_ops(&mut self, ops: &[EnvOp]) {
        for op in ops {
            match op {
                EnvOp::Set(set) => {
                    self.search_paths.remove(&set.set);
                    self.variables.insert(set.set.clone(), set.value.clone());
                }
                EnvOp::Prepend(prepend) => self.extend(
                    &prepend.prepend,
                    &prepend.value,
                    prepend.separator.as_deref(),
                    true,
                ),
                EnvOp::Append(append) => self.extend(
                    &append.append,
                    &append.value,
                    append.separator.as_deref(),
                    false,
                ),
                EnvOp::Comment(comment) => self.comments.push(comment.comment.clone()),
                EnvOp::Priority(_) => {}
            }
        }
    }

    fn extend(&mut self, name: &str, value: &str, separator: Option<&str>, front: bool) {
        let separator = separator.unwrap_or(DEFAULT_SEPARATOR);
        if separator == DEFAULT_SEPARATOR && !self.variables.contains_key(name) {
            let paths = self.search_paths.entry(name.to_string()).or_default();
            if front {
                paths.insert(0, value.to_string());
            } else {
                paths.push(value.to_string());
            }
            return;
        }

        let current = self.get(name);
        self.search_paths.remove(name);
        let combined = match current {
            Some(existing) if !existing.is_empty() => {
                if front {
                    format!("{value}{separator}{existing}")
                } else {
                    format!("{existing}{separator}{value}")
                }
            }
            _ => value.to_string(),
        };
        self.variables.insert(name.to_string(), combined);
    }
}

/// Render a POSIX sh script that establishes the environment.
pub fn generate_startup_script(env: &EnvironmentDescriptor) -> String {
    let mut script = String::from("#!/bin/sh\n# Generated by envforge\n");
    for comment in &env.comments {
        for line in comment.lines() {
            script.push_str("# ");
            script.push_str(line);
            script.push('\n');
        }
    }
    for (name, value) in env.to_env() {
        script.push_str(&format!("export {name}=\"{}\"\n", escape(&value)));
    }
    script
}

/// Escape a value for use inside double quotes.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
