//! Durable checkpoint state.
//!
//! Per-partition key/value maps are mirrored into a key-value store keyed by
//! (hub namespace, hub name, consumer group, partition). Absence of a record
//! is not an error; it means the partition is read from the beginning.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::{ConsumerGroup, HubConfig};
use crate::message::Offset;
use crate::Result;

pub mod azure;
pub mod in_memory_store;

/// State key under which a partition's last observed offset is recorded.
pub const OFFSET_STATE_KEY: &str = "offset";

/// Per-partition key/value state. The `offset` key tracks the last
/// broker-assigned offset observed on the partition; callers may keep
/// arbitrary auxiliary keys alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionState(BTreeMap<String, String>);

impl PartitionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> Option<Offset> {
        self.0.get(OFFSET_STATE_KEY).map(|value| Offset::new(value.clone()))
    }

    pub fn set_offset(&mut self, offset: Offset) {
        self.0
            .insert(OFFSET_STATE_KEY.to_string(), offset.as_str().to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Persisted record for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub state: PartitionState,
}

/// Identifies the checkpoint namespace of one (hub, consumer group) pair.
/// Records of different hubs or groups never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointNamespace {
    pub hub_namespace: String,
    pub hub_name: String,
    pub group: ConsumerGroup,
}

impl CheckpointNamespace {
    pub fn new(hub: &HubConfig, group: &ConsumerGroup) -> Self {
        CheckpointNamespace {
            hub_namespace: hub.namespace.clone(),
            hub_name: hub.hub_name.clone(),
            group: group.clone(),
        }
    }
}

/// Batched access to the durable store behind checkpointing. This seam is
/// the only place the scheduler and session startup touch durable storage.
#[trait_variant::make(Send)]
pub trait CheckpointStore: Clone + Send + Sync + 'static {
    /// Upserts the given per-partition records. Stores may apply entries
    /// best-effort rather than atomically; callers must not assume
    /// atomicity across partitions. Fails with [`crate::Error::Persist`].
    async fn put(&self, namespace: &CheckpointNamespace, entries: Vec<CheckpointEntry>)
    -> Result<()>;

    /// Looks up the given partitions. The result holds an entry for every
    /// requested id; a partition with no prior record maps to an empty
    /// state. Only transport/auth failures are errors
    /// ([`crate::Error::Retrieve`]).
    async fn get(
        &self,
        namespace: &CheckpointNamespace,
        partition_ids: &[String],
    ) -> Result<HashMap<String, PartitionState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_offset_round_trip() {
        let mut state = PartitionState::new();
        assert!(state.is_empty());
        assert_eq!(state.offset(), None);

        state.set_offset(Offset::from("17"));
        assert_eq!(state.offset(), Some(Offset::from("17")));

        // Same value again leaves the state unchanged.
        let before = state.clone();
        state.set_offset(Offset::from("17"));
        assert_eq!(state, before);
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let mut state = PartitionState::new();
        state.set_offset(Offset::from("99"));
        state.insert("lease", "worker-3");
        let entry = CheckpointEntry {
            id: "4".to_string(),
            state,
        };

        let encoded = serde_json::to_string(&entry).unwrap();
        let decoded: CheckpointEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }
}
