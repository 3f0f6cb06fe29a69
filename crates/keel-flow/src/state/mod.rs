//! Last-applied state of each node.
//!
//! The scheduler diffs a node's resolved desired state against its
//! [`AppliedRecord`] to decide between create, update and no-op, and uses
//! the records of nodes that are no longer declared for orphan teardown and
//! `destroy`.
//!
//! ## Design Principles
//!
//! - **Fingerprints, not values**: records hold canonical JSON fingerprints
//!   of the desired state, so secret references never need re-reading
//! - **One writer per record**: only the node's own operation writes it
//! - **Testability**: in-memory implementation; the CLI snapshots it to JSON

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{NodeId, PhysicalId};

use crate::error::Result;
use crate::node::{Outputs, ResourceKind};

pub use memory::InMemoryStateStore;

/// What the last successful apply did to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    /// Node ID.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identity.
    pub physical_id: PhysicalId,
    /// Fingerprint of the resolved desired state (with secret versions).
    pub fingerprint: String,
    /// Fingerprint with `Latest` secret versions left symbolic.
    pub config_fingerprint: String,
    /// Outputs published by the node.
    #[serde(default)]
    pub outputs: Outputs,
    /// Secret versions the node consumed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_versions: BTreeMap<NodeId, u64>,
    /// Digest of the stored material, for secret nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    /// Dependencies at the time of apply; drives teardown order.
    #[serde(default)]
    pub dependencies: BTreeSet<NodeId>,
    /// True while the node's confirmation gate has not confirmed.
    #[serde(default)]
    pub gate_pending: bool,
    /// When the record was written.
    pub applied_at: DateTime<Utc>,
}

/// Storage for applied records.
///
/// Implementations must be `Send + Sync`; node operations write their own
/// records concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record of a node.
    ///
    /// Returns `None` if the node was never applied.
    async fn get(&self, node_id: &NodeId) -> Result<Option<AppliedRecord>>;

    /// Inserts or replaces a record.
    async fn put(&self, record: AppliedRecord) -> Result<()>;

    /// Removes a record. Removing a missing record is not an error.
    async fn remove(&self, node_id: &NodeId) -> Result<()>;

    /// Lists every record, ordered by node ID.
    async fn list(&self) -> Result<Vec<AppliedRecord>>;
}
