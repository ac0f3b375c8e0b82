//! Container name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{TopoError, TopoResult};

/// A validated container identifier.
///
/// Identifiers follow the containerd rules:
/// - 1-76 characters long
/// - alphanumeric components separated by a single `.`, `_` or `-`
/// - starting and ending with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container identifier.
    pub const MAX_LENGTH: usize = 76;

    /// Length of the abbreviated form.
    pub const SHORT_LENGTH: usize = 12;

    /// Create a new container identifier, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidContainerName`] if the format is invalid.
    pub fn new(id: impl Into<String>) -> TopoResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> TopoResult<()> {
        let invalid = || TopoError::InvalidContainerName { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut prev_separator = true;
        for c in id.chars() {
            if c.is_ascii_alphanumeric() {
                prev_separator = false;
            } else if matches!(c, '.' | '_' | '-') && !prev_separator {
                prev_separator = true;
            } else {
                return Err(invalid());
            }
        }
        if prev_separator {
            return Err(invalid());
        }

        Ok(())
    }

    /// Returns the abbreviated form of the identifier.
    #[must_use]
    pub fn short(&self) -> &str {
        short_id(&self.0)
    }
}

/// First twelve characters of an identifier.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.char_indices()
        .nth(ContainerId::SHORT_LENGTH)
        .map_or(id, |(idx, _)| &id[..idx])
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(ContainerId::new("srl1").is_ok());
        assert!(ContainerId::new("clab-lab-srl1").is_ok());
        assert!(ContainerId::new("clab_lab.ceos-1").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-srl").is_err());
        assert!(ContainerId::new("srl-").is_err());
        assert!(ContainerId::new("srl--1").is_err());
        assert!(ContainerId::new("srl 1").is_err());
        assert!(ContainerId::new("a".repeat(77)).is_err());
    }

    #[test]
    fn short_form() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("srl1"), "srl1");
        assert_eq!(ContainerId::new("clab-lab-router1").unwrap().short(), "clab-lab-rou");
    }
}
