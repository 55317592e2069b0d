//! In-memory implementation of the checkpoint store for simple use cases
//! and testing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Result;
use crate::checkpoint::{CheckpointEntry, CheckpointNamespace, CheckpointStore, PartitionState};

#[derive(Clone, Default, Debug)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default, Debug)]
struct StoreInner {
    records: HashMap<CheckpointNamespace, HashMap<String, PartitionState>>,
    put_calls: usize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batched `put` calls issued so far, across all namespaces.
    pub fn put_calls(&self) -> usize {
        self.inner.lock().put_calls
    }

    /// Directly reads one persisted record, bypassing the store contract.
    pub fn record(&self, namespace: &CheckpointNamespace, partition_id: &str) -> Option<PartitionState> {
        self.inner
            .lock()
            .records
            .get(namespace)
            .and_then(|records| records.get(partition_id))
            .cloned()
    }

    /// Seeds a record as if it had been persisted by an earlier process.
    pub fn preload(
        &self,
        namespace: &CheckpointNamespace,
        partition_id: impl Into<String>,
        state: PartitionState,
    ) {
        self.inner
            .lock()
            .records
            .entry(namespace.clone())
            .or_default()
            .insert(partition_id.into(), state);
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        namespace: &CheckpointNamespace,
        entries: Vec<CheckpointEntry>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.put_calls += 1;
        let records = inner.records.entry(namespace.clone()).or_default();
        for entry in entries {
            records.insert(entry.id, entry.state);
        }
        Ok(())
    }

    async fn get(
        &self,
        namespace: &CheckpointNamespace,
        partition_ids: &[String],
    ) -> Result<HashMap<String, PartitionState>> {
        let inner = self.inner.lock();
        let records = inner.records.get(namespace);
        Ok(partition_ids
            .iter()
            .map(|id| {
                let state = records
                    .and_then(|records| records.get(id))
                    .cloned()
                    .unwrap_or_default();
                (id.clone(), state)
            })
            .collect())
    }
}
