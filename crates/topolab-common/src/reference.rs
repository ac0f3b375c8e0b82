//! Canonical image references.
//!
//! Engines store images under fully-qualified names, so presence checks
//! must compare against the canonical form of whatever the node asked for.

use std::fmt;
use std::str::FromStr;

use crate::error::{TopoError, TopoResult};

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// Tag assumed when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port when given.
    pub registry: String,
    /// Repository path below the registry.
    pub repository: String,
    /// Tag or digest.
    pub version: ImageVersion,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageVersion {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `ghcr.io/nokia/srlinux:23.10` -> unchanged
    /// - `localhost:5000/ceos` -> localhost:5000/ceos:latest
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::Config`] for an empty reference.
    pub fn parse(reference: &str) -> TopoResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(TopoError::Config {
                message: "empty image reference".to_string(),
            });
        }

        let (name, version) = if let Some((name, digest)) = reference.split_once('@') {
            (name, ImageVersion::Digest(digest.to_string()))
        } else {
            // a colon after the last slash is a tag, before it a registry port
            let last_segment = reference.rfind('/').map_or(0, |i| i + 1);
            match reference[last_segment..].rfind(':') {
                Some(idx) => {
                    let split = last_segment + idx;
                    (
                        &reference[..split],
                        ImageVersion::Tag(reference[split + 1..].to_string()),
                    )
                }
                None => (reference, ImageVersion::Tag(DEFAULT_TAG.to_string())),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        Ok(Self {
            registry,
            repository,
            version,
        })
    }
}

impl FromStr for ImageReference {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            ImageVersion::Tag(t) => write!(f, "{}/{}:{t}", self.registry, self.repository),
            ImageVersion::Digest(d) => write!(f, "{}/{}@{d}", self.registry, self.repository),
        }
    }
}

/// Fully-qualified form of an image reference.
///
/// # Errors
///
/// Returns an error for an empty reference.
pub fn canonical_image_name(reference: &str) -> TopoResult<String> {
    ImageReference::parse(reference).map(|r| r.to_string())
}
