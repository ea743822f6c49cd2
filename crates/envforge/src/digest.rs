// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! Content addresses and the canonical encoding used to compute them.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

#[cfg(test)]
#[path = "./digest_test.rs"]
mod digest_test;

/// Size of a digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// A sha256 content address, displayed as unpadded base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Hash a single byte string.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = DigestBuilder::new("envforge/bytes/v0");
        hasher.write_bytes(bytes);
        hasher.finish()
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Shortened form used in logs.
    pub fn short(&self) -> String {
        self.to_string()[..10].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Error returned when a string is not a valid digest.
#[derive(Debug, thiserror::Error)]
#[error("Invalid digest '{0}'")]
pub struct InvalidDigest(String);

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| InvalidDigest(s.to_string()))?;
        let bytes: [u8; DIGEST_SIZE] = bytes
            .try_into()
            .map_err(|_| InvalidDigest(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher with an unambiguous, length-prefixed encoding.
///
/// Every value is written with its length so that concatenation can never
/// make two different input sequences collide. The domain string keeps
/// digests of different kinds of object apart.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.write_str(domain);
        builder
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    /// Write a sequence, prefixed with its length.
    pub fn write_strs<'a, I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: ExactSizeIterator,
    {
        let items = items.into_iter();
        self.hasher.update((items.len() as u64).to_le_bytes());
        for item in items {
            self.write_str(item);
        }
        self
    }

    pub fn write_digest(&mut self, digest: &Digest) -> &mut Self {
        self.hasher.update(digest.as_bytes());
        self
    }

    pub fn write_count(&mut self, count: usize) -> &mut Self {
        self.hasher.update((count as u64).to_le_bytes());
        self
    }

    pub fn finish(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}
