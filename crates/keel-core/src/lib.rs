//! # keel-core
//!
//! Shared primitives for the keel declarative orchestration core.
//!
//! This crate provides the foundational types used across all keel crates:
//!
//! - **Identifiers**: Strongly-typed IDs for nodes, physical resources and apply runs
//! - **Error Types**: Shared error definitions and result types
//! - **Canonical JSON**: Deterministic encoding used for desired-state fingerprints
//! - **Observability**: Logging initialization, span helpers and [`Redacted`](observability::Redacted)
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! let node = NodeId::new("root-alias").unwrap();
//! let apply = ApplyId::generate();
//! assert_eq!(node.to_string(), "root-alias");
//! let _ = apply;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use keel_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::canonical_json::{fingerprint, to_canonical_string};
    pub use crate::error::{Error, Result};
    pub use crate::id::{ApplyId, NodeId, PhysicalId};
    pub use crate::observability::{LogFormat, Redacted, init_logging};
}

pub use error::{Error, Result};
pub use id::{ApplyId, NodeId, PhysicalId};
pub use observability::Redacted;
