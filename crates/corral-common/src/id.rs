//! Container, pod and exec-session identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CorralError, CorralResult};

/// Maximum length of a container or pod ID.
pub const MAX_ID_LENGTH: usize = 64;

/// Validate an entity ID string.
///
/// IDs must be 1-64 characters, start with an alphanumeric character and
/// contain only alphanumerics, hyphens and underscores.
fn validate(kind: &'static str, id: &str) -> CorralResult<()> {
    let invalid = || CorralError::Config {
        message: format!("invalid {kind} ID: {id:?}"),
    };

    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err(invalid());
    }

    let mut chars = id.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    if chars.any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_') {
        return Err(invalid());
    }

    Ok(())
}

/// Generate a 12-character hex ID derived from a UUID v4.
fn random_hex() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..6])
}

/// A validated container ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> CorralResult<Self> {
        let id = id.into();
        validate("container", &id)?;
        Ok(Self(id))
    }

    /// Generate a new random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_hex())
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }
}

impl TryFrom<String> for ContainerId {
    type Error = CorralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated pod ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodId(String);

impl PodId {
    /// Create a new pod ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> CorralResult<Self> {
        let id = id.into();
        validate("pod", &id)?;
        Ok(Self(id))
    }

    /// Generate a new random pod ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_hex())
    }

    /// Get the pod ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PodId {
    type Error = CorralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PodId> for String {
    fn from(id: PodId) -> Self {
        id.0
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PodId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of an exec session inside a container.
///
/// Sessions are always generated, never supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecSessionId(String);

impl ExecSessionId {
    /// Generate a new random session ID (32 hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
