//! In-memory state store.
//!
//! ## Limitations
//!
//! - **No persistence**: records live as long as the store; the CLI saves
//!   [`InMemoryStateStore::snapshot`] to a file between invocations
//! - **Single-process only**

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use keel_core::NodeId;

use super::{AppliedRecord, StateStore};
use crate::error::{Error, Result};

/// In-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<NodeId, AppliedRecord>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `records`.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = AppliedRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.node_id.clone(), r))
                    .collect(),
            ),
        }
    }

    /// Returns every record, ordered by node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<AppliedRecord>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.values().cloned().collect())
    }

    /// Returns the number of records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, node_id: &NodeId) -> Result<Option<AppliedRecord>> {
        let result = {
            let records = self.records.read().map_err(poison_err)?;
            records.get(node_id).cloned()
        };
        Ok(result)
    }

    async fn put(&self, record: AppliedRecord) -> Result<()> {
        {
            let mut records = self.records.write().map_err(poison_err)?;
            records.insert(record.node_id.clone(), record);
        }
        Ok(())
    }

    async fn remove(&self, node_id: &NodeId) -> Result<()> {
        {
            let mut records = self.records.write().map_err(poison_err)?;
            records.remove(node_id);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AppliedRecord>> {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Outputs, ResourceKind};
    use chrono::Utc;
    use keel_core::PhysicalId;

    fn record(id: &str) -> AppliedRecord {
        AppliedRecord {
            node_id: NodeId::new(id).unwrap(),
            kind: ResourceKind::LogGroup,
            physical_id: PhysicalId::new(format!("/ecs/{id}")).unwrap(),
            fingerprint: "sha256:aa".into(),
            config_fingerprint: "sha256:aa".into(),
            outputs: Outputs::new(),
            secret_versions: BTreeMap::new(),
            content_digest: None,
            dependencies: std::collections::BTreeSet::new(),
            gate_pending: false,
            applied_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_remove() {
        let store = InMemoryStateStore::new();
        store.put(record("logs")).await.unwrap();
        let id = NodeId::new("logs").unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().physical_id.as_str(), "/ecs/logs");

        store.remove(&id).await.unwrap();
        store.remove(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_and_snapshot_round_trips() {
        let store = InMemoryStateStore::from_records([record("b"), record("a")]);
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.node_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let json = serde_json::to_string(&store.snapshot().unwrap()).unwrap();
        let restored: Vec<AppliedRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(InMemoryStateStore::from_records(restored).len().unwrap(), 2);
    }
}
