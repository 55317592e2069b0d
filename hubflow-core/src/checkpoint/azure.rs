//! Azure Table storage adapter for the checkpoint store seam.

use std::collections::HashMap;

use hubflow_azure::{AzureTableConfig, StateEntity, StateTableClient};

use crate::checkpoint::{CheckpointEntry, CheckpointNamespace, CheckpointStore, PartitionState};
use crate::{Error, Result};

/// Checkpoint store backed by one Azure Table storage account. State maps
/// are persisted as a single JSON blob column per (group, partition) row.
#[derive(Clone)]
pub struct AzureTableStore {
    client: StateTableClient,
}

impl AzureTableStore {
    pub fn new(config: AzureTableConfig) -> Result<Self> {
        let client = StateTableClient::new(config)
            .map_err(|e| Error::Config(format!("Azure Table client: {e}")))?;
        Ok(AzureTableStore { client })
    }
}

impl CheckpointStore for AzureTableStore {
    async fn put(
        &self,
        namespace: &CheckpointNamespace,
        entries: Vec<CheckpointEntry>,
    ) -> Result<()> {
        let entities = entries
            .into_iter()
            .map(|entry| {
                let state = serde_json::to_string(&entry.state)
                    .map_err(|e| Error::Persist(format!("encoding state for {}: {e}", entry.id)))?;
                Ok(StateEntity {
                    id: entry.id,
                    state,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.client
            .store_state(
                &namespace.hub_namespace,
                &namespace.hub_name,
                namespace.group.as_str(),
                entities,
            )
            .await
            .map_err(|e| Error::Persist(e.to_string()))
    }

    async fn get(
        &self,
        namespace: &CheckpointNamespace,
        partition_ids: &[String],
    ) -> Result<HashMap<String, PartitionState>> {
        let found = self
            .client
            .retrieve_state(
                &namespace.hub_namespace,
                &namespace.hub_name,
                namespace.group.as_str(),
                partition_ids,
            )
            .await
            .map_err(|e| Error::Retrieve(e.to_string()))?;

        partition_ids
            .iter()
            .map(|id| {
                let state = match found.get(id).and_then(|blob| blob.as_deref()) {
                    Some(blob) => serde_json::from_str(blob).map_err(|e| {
                        Error::Retrieve(format!("corrupt checkpoint record for {id}: {e}"))
                    })?,
                    None => PartitionState::default(),
                };
                Ok((id.clone(), state))
            })
            .collect()
    }
}
