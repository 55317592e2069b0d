//! Entry point tying together hub identity, auth, discovery, and the
//! consumer/producer surfaces.

use std::sync::Arc;

use rand::Rng;

use crate::auth::SasTokenProvider;
use crate::config::{ConsumerGroup, HubConfig};
use crate::directory::{PartitionDescriptor, PartitionDirectory, PartitionLister};
use crate::processor::GroupProcessor;
use crate::session::{PartitionSession, SharedPartitionState};
use crate::transport::HubTransport;
use crate::{Error, Result};

/// Handle to one event hub. Owns the derived endpoint URIs, the token
/// provider, the transport handle, and the partition directory shared by
/// every session and processor created from it.
pub struct EventHub<T, L> {
    config: Arc<HubConfig>,
    token_provider: Arc<SasTokenProvider>,
    transport: T,
    directory: Arc<PartitionDirectory<L>>,
}

impl<T: HubTransport, L: PartitionLister> EventHub<T, L> {
    pub fn new(config: HubConfig, transport: T, lister: L) -> Self {
        let token_provider = Arc::new(SasTokenProvider::new(&config));
        EventHub {
            config: Arc::new(config),
            token_provider,
            transport,
            directory: Arc::new(PartitionDirectory::new(lister)),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Token provider for transport implementations that need to present
    /// an authorization header.
    pub fn token_provider(&self) -> &Arc<SasTokenProvider> {
        &self.token_provider
    }

    /// Partition descriptors for a group, cached after the first query.
    pub async fn partitions(
        &self,
        group: Option<&str>,
    ) -> Result<Arc<Vec<PartitionDescriptor>>> {
        self.directory
            .discover(&ConsumerGroup::normalize(group))
            .await
    }

    /// Standalone session pinned to one partition of the group.
    pub async fn partition_session(
        &self,
        group: Option<&str>,
        partition_id: &str,
    ) -> Result<PartitionSession<T>> {
        let group = ConsumerGroup::normalize(group);
        let partitions = self.directory.discover(&group).await?;
        if !partitions.iter().any(|p| p.id == partition_id) {
            return Err(Error::discovery(
                format!(
                    "unknown partition {partition_id} in hub {}",
                    self.config.hub_name
                ),
                None,
            ));
        }
        Ok(PartitionSession::new(
            Arc::clone(&self.config),
            group,
            partition_id.to_string(),
            self.transport.clone(),
            None,
            SharedPartitionState::default(),
        ))
    }

    /// Session pinned to a uniformly chosen partition of the group.
    pub async fn random_partition_session(
        &self,
        group: Option<&str>,
    ) -> Result<PartitionSession<T>> {
        let normalized = ConsumerGroup::normalize(group);
        let partitions = self.directory.discover(&normalized).await?;
        let index = rand::thread_rng().gen_range(0..partitions.len());
        let descriptor = partitions
            .get(index)
            .expect("index drawn within partition count");
        self.partition_session(group, &descriptor.id).await
    }

    /// Consumer-group processor sharing this hub's directory cache.
    pub fn group_processor(&self, group: Option<&str>) -> GroupProcessor<T, L> {
        GroupProcessor::new(
            Arc::clone(&self.config),
            group,
            self.transport.clone(),
            Arc::clone(&self.directory),
        )
    }
}
