//! Persistence boundary for liveness records.
//!
//! The store behind this trait only needs conditional writes keyed on the
//! record version; everything else (caching, retry policy) lives in
//! `NodeLiveness`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::liveness::record::{Liveness, Record};
use crate::types::NodeId;

/// Conditional write: apply `new_liveness` only if the stored record is still
/// at `expected.version`.
#[derive(Debug, Clone)]
pub struct LivenessUpdate {
    pub new_liveness: Liveness,
    pub expected: Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Committed(Record),
    /// The stored record moved on; carries what is actually stored.
    ConditionFailed(Record),
}

#[async_trait]
pub trait LivenessStorage: Send + Sync + 'static {
    async fn get(&self, node_id: NodeId) -> anyhow::Result<Option<Record>>;

    async fn update(&self, update: LivenessUpdate) -> anyhow::Result<UpdateOutcome>;

    /// Creates the initial record for a node. Fails if one already exists.
    async fn create(&self, node_id: NodeId) -> anyhow::Result<()>;

    async fn scan(&self) -> anyhow::Result<Vec<Record>>;
}

/// In-memory `LivenessStorage`.
///
/// Used by tests and the simulator; not persisted across restarts.
#[derive(Default)]
pub struct MemLivenessStorage {
    records: RwLock<BTreeMap<NodeId, Record>>,
}

impl MemLivenessStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a record unconditionally, bumping its version. Simulates a
    /// competing writer.
    pub async fn force_write(&self, liveness: Liveness) -> Record {
        let mut records = self.records.write().await;
        let version = records
            .get(&liveness.node_id)
            .map(|r| r.version + 1)
            .unwrap_or(1);
        let record = Record { liveness, version };
        records.insert(record.liveness.node_id, record.clone());
        record
    }
}

#[async_trait]
impl LivenessStorage for MemLivenessStorage {
    async fn get(&self, node_id: NodeId) -> anyhow::Result<Option<Record>> {
        Ok(self.records.read().await.get(&node_id).cloned())
    }

    async fn update(&self, update: LivenessUpdate) -> anyhow::Result<UpdateOutcome> {
        let node_id = update.new_liveness.node_id;
        let mut records = self.records.write().await;
        let Some(current) = records.get(&node_id) else {
            anyhow::bail!("liveness record for n{node_id} does not exist");
        };
        if current.version != update.expected.version {
            return Ok(UpdateOutcome::ConditionFailed(current.clone()));
        }
        let record = Record {
            liveness: update.new_liveness,
            version: current.version + 1,
        };
        records.insert(node_id, record.clone());
        Ok(UpdateOutcome::Committed(record))
    }

    async fn create(&self, node_id: NodeId) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&node_id) {
            anyhow::bail!("liveness record for n{node_id} already exists");
        }
        records.insert(
            node_id,
            Record {
                liveness: Liveness::new(node_id),
                version: 1,
            },
        );
        Ok(())
    }

    async fn scan(&self) -> anyhow::Result<Vec<Record>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_update_reports_current_record() {
        let storage = MemLivenessStorage::new();
        storage.create(3).await.expect("create");
        assert!(storage.create(3).await.is_err());

        let first = storage.get(3).await.expect("get").expect("record");
        let mut next = first.liveness.clone();
        next.expiration_ms = 1_000;
        let committed = match storage
            .update(LivenessUpdate {
                new_liveness: next.clone(),
                expected: first.clone(),
            })
            .await
            .expect("update")
        {
            UpdateOutcome::Committed(rec) => rec,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(committed.version, first.version + 1);

        next.expiration_ms = 2_000;
        match storage
            .update(LivenessUpdate {
                new_liveness: next,
                expected: first,
            })
            .await
            .expect("update")
        {
            UpdateOutcome::ConditionFailed(actual) => assert_eq!(actual, committed),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
