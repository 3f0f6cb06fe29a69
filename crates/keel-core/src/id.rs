//! Strongly-typed identifiers for keel entities.
//!
//! - [`NodeId`]: stable, caller-assigned name of a resource node
//! - [`PhysicalId`]: provider-assigned identity of a materialized resource
//! - [`ApplyId`]: ULID identifying a single apply/destroy invocation
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{ApplyId, NodeId};
//!
//! let node = NodeId::new("app-load-balancer").unwrap();
//! let apply = ApplyId::generate();
//! assert_eq!(node.as_str(), "app-load-balancer");
//! assert!(!apply.to_string().is_empty());
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum length of a node identifier.
pub const MAX_NODE_ID_LEN: usize = 128;

/// Caller-assigned identifier of a resource node.
///
/// Node IDs are stable across apply invocations: they are the key used to
/// match a declaration against its last-applied record. Allowed characters
/// are ASCII alphanumerics plus `-`, `_` and `.`; the first character must be
/// alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Creates a validated node ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty, too long, or
    /// contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_node_id(&value)?;
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_node_id(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidId {
            message: "node ID cannot be empty".to_string(),
        });
    }
    if value.len() > MAX_NODE_ID_LEN {
        return Err(Error::InvalidId {
            message: format!("node ID '{value}' exceeds {MAX_NODE_ID_LEN} characters"),
        });
    }
    let mut chars = value.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidId {
            message: format!("node ID '{value}' must start with an alphanumeric character"),
        });
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::InvalidId {
            message: format!("node ID '{value}' contains invalid character '{bad}'"),
        });
    }
    Ok(())
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Provider-assigned identity of a materialized resource (ARN, resource ID).
///
/// A physical ID is never empty; an unmaterialized node simply has none.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhysicalId(String);

impl PhysicalId {
    /// Creates a physical ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::InvalidId {
                message: "physical ID cannot be empty".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhysicalId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PhysicalId> for String {
    fn from(id: PhysicalId) -> Self {
        id.0
    }
}

/// A unique identifier for an apply or destroy invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplyId(Ulid);

impl ApplyId {
    /// Generates a new unique apply ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an apply ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for ApplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApplyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid apply ID '{s}': {e}"),
            })
    }
}
