//! Partition discovery and caching.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::ConsumerGroup;
use crate::{Error, Result};

/// Point-in-time description of one partition as reported by the broker.
/// Descriptors are not refreshed after first discovery; a caller that needs
/// a fresh view creates a new directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionDescriptor {
    pub id: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub begin_sequence: i64,
    pub end_sequence: i64,
}

/// Broker query for the partition set of a consumer group. The wire protocol
/// (HTTPS feed retrieval and parsing) lives behind this seam; failures are
/// reported as [`Error::Discovery`] with the broker's status code attached
/// when one was seen.
#[trait_variant::make(Send)]
pub trait PartitionLister: Clone + Send + Sync + 'static {
    async fn list_partitions(&self, group: &ConsumerGroup) -> Result<Vec<PartitionDescriptor>>;
}

/// Caches the partition set per consumer group for its own lifetime. A
/// second `discover` for the same group returns the cached set without a
/// broker round trip.
pub struct PartitionDirectory<L> {
    lister: L,
    cache: Mutex<HashMap<ConsumerGroup, Arc<Vec<PartitionDescriptor>>>>,
}

impl<L: PartitionLister> PartitionDirectory<L> {
    pub fn new(lister: L) -> Self {
        PartitionDirectory {
            lister,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Partition descriptors for `group`, fetched once and cached.
    pub async fn discover(&self, group: &ConsumerGroup) -> Result<Arc<Vec<PartitionDescriptor>>> {
        if let Some(cached) = self.cache.lock().get(group) {
            return Ok(Arc::clone(cached));
        }
        let listed = self.lister.list_partitions(group).await?;
        if listed.is_empty() {
            // A hub always has at least one partition; an empty feed means
            // the broker response was not understood.
            return Err(Error::discovery(
                format!("broker returned no partitions for group {group}"),
                None,
            ));
        }
        debug!(group = %group, partitions = listed.len(), "Discovered partitions");
        let listed = Arc::new(listed);
        self.cache
            .lock()
            .insert(group.clone(), Arc::clone(&listed));
        Ok(listed)
    }

    /// Cached descriptors for `group`, when a discover already ran.
    pub fn cached(&self, group: &ConsumerGroup) -> Option<Arc<Vec<PartitionDescriptor>>> {
        self.cache.lock().get(group).map(Arc::clone)
    }
}

/// Fixed partition set, for tests and for deployments whose partition
/// layout is known up front.
#[derive(Debug, Clone)]
pub struct StaticPartitionLister {
    descriptors: Vec<PartitionDescriptor>,
}

impl StaticPartitionLister {
    pub fn new(descriptors: Vec<PartitionDescriptor>) -> Self {
        StaticPartitionLister { descriptors }
    }

    /// Descriptor set with the given ids and empty statistics.
    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        let descriptors = ids
            .into_iter()
            .map(|id| PartitionDescriptor {
                id: id.into(),
                published_at: now,
                updated_at: now,
                size_bytes: 0,
                begin_sequence: 0,
                end_sequence: 0,
            })
            .collect();
        StaticPartitionLister { descriptors }
    }
}

impl PartitionLister for StaticPartitionLister {
    async fn list_partitions(&self, _group: &ConsumerGroup) -> Result<Vec<PartitionDescriptor>> {
        Ok(self.descriptors.clone())
    }
}
