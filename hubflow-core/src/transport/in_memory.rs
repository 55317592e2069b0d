//! In-memory implementation of the hub transport for simple use cases and
//! testing. Behaves like a tiny single-process broker: one append-only log
//! per partition with offsets assigned from 1, server-side selector
//! filtering on subscribe, and key-hash routing for hub-level keyed sends.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ConsumerGroup;
use crate::directory::{PartitionDescriptor, PartitionLister};
use crate::message::{InboundMessage, OFFSET_ANNOTATION, OutboundMessage};
use crate::transport::{HubTransport, SelectorFilter, Subscription};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct InMemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default, Debug)]
struct HubState {
    partitions: BTreeMap<String, PartitionLog>,
}

#[derive(Default, Debug)]
struct PartitionLog {
    last_offset: u64,
    entries: Vec<(u64, Bytes)>,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::UnboundedSender<Result<InboundMessage>>,
    /// Offsets at or below this value are withheld from the subscriber.
    after: Option<u64>,
}

impl InMemoryHub {
    /// Hub whose partitions carry the given ids.
    pub fn new(partition_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let partitions = partition_ids
            .into_iter()
            .map(|id| (id.into(), PartitionLog::default()))
            .collect();
        InMemoryHub {
            inner: Arc::new(Mutex::new(HubState { partitions })),
        }
    }

    /// Hub with `count` partitions named `"0"` through `"count - 1"`.
    pub fn with_partitions(count: usize) -> Self {
        Self::new((0..count).map(|id| id.to_string()))
    }

    /// Number of messages appended to one partition so far.
    pub fn message_count(&self, partition_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .partitions
            .get(partition_id)
            .map(|log| log.entries.len())
    }

    /// Number of live receive links on one partition.
    pub fn subscriber_count(&self, partition_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .partitions
            .get(partition_id)
            .map(|log| log.subscribers.len())
    }

    fn append(state: &mut HubState, partition_id: &str, body: Bytes) -> Result<()> {
        let log = state
            .partitions
            .get_mut(partition_id)
            .ok_or_else(|| Error::Send(format!("unknown partition {partition_id}")))?;
        log.last_offset += 1;
        let offset = log.last_offset;
        log.entries.push((offset, body.clone()));
        log.subscribers.retain(|subscriber| {
            if subscriber.after.is_some_and(|after| offset <= after) {
                return true;
            }
            subscriber
                .tx
                .send(Ok(inbound(partition_id, offset, body.clone())))
                .is_ok()
        });
        Ok(())
    }

    fn route_by_key(state: &HubState, key: &str) -> Option<String> {
        if state.partitions.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % state.partitions.len();
        state.partitions.keys().nth(index).cloned()
    }
}

fn inbound(partition_id: &str, offset: u64, payload: Bytes) -> InboundMessage {
    InboundMessage {
        partition_id: partition_id.to_string(),
        payload,
        annotations: HashMap::from([(OFFSET_ANNOTATION.to_string(), offset.to_string())]),
    }
}

/// Partition id embedded in a subscribe or send address, when present.
fn partition_id_from_uri(uri: &str) -> Option<&str> {
    let (_, id) = uri.rsplit_once("/Partitions/")?;
    let id = id.trim_end_matches('/');
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

impl HubTransport for InMemoryHub {
    async fn subscribe(
        &self,
        source_uri: &str,
        filter: Option<SelectorFilter>,
    ) -> Result<Subscription> {
        let partition_id = partition_id_from_uri(source_uri)
            .ok_or_else(|| Error::Subscribe(format!("malformed source uri {source_uri}")))?
            .to_string();
        let after = match filter {
            Some(filter) => Some(filter.offset().as_str().parse::<u64>().map_err(|_| {
                Error::Subscribe(format!("unsupported selector offset {}", filter.offset()))
            })?),
            None => None,
        };

        let mut inner = self.inner.lock();
        let log = inner
            .partitions
            .get_mut(&partition_id)
            .ok_or_else(|| Error::Subscribe(format!("unknown partition {partition_id}")))?;

        let (tx, subscription) = Subscription::channel();
        for (offset, payload) in &log.entries {
            if after.is_none_or(|after| *offset > after) {
                let _ = tx.send(Ok(inbound(&partition_id, *offset, payload.clone())));
            }
        }
        log.subscribers.push(Subscriber { tx, after });
        Ok(subscription)
    }

    async fn send(&self, address: &str, message: OutboundMessage) -> Result<()> {
        let mut inner = self.inner.lock();
        match partition_id_from_uri(address) {
            Some(partition_id) => {
                let partition_id = partition_id.to_string();
                Self::append(&mut inner, &partition_id, message.body)
            }
            None => {
                let key = message.partition_key.ok_or_else(|| {
                    Error::Send("hub-level send requires a partition key".to_string())
                })?;
                let partition_id = Self::route_by_key(&inner, &key)
                    .ok_or_else(|| Error::Send("hub has no partitions".to_string()))?;
                Self::append(&mut inner, &partition_id, message.body)
            }
        }
    }
}

impl PartitionLister for InMemoryHub {
    async fn list_partitions(&self, _group: &ConsumerGroup) -> Result<Vec<PartitionDescriptor>> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(inner
            .partitions
            .iter()
            .map(|(id, log)| PartitionDescriptor {
                id: id.clone(),
                published_at: now,
                updated_at: now,
                size_bytes: log.entries.iter().map(|(_, payload)| payload.len() as u64).sum(),
                begin_sequence: 0,
                end_sequence: log.entries.len() as i64,
            })
            .collect())
    }
}
