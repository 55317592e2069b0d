//! One partition's subscription, receive loop, offset tracking, and send
//! path.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::checkpoint::in_memory_store::InMemoryCheckpointStore;
use crate::checkpoint::{CheckpointEntry, CheckpointNamespace, CheckpointStore, PartitionState};
use crate::config::{ConsumerGroup, HubConfig};
use crate::message::{Event, Offset, OutboundMessage};
use crate::transport::{HubTransport, SelectorFilter, Subscription};
use crate::{Error, Result};

/// Shared handle to one partition's in-memory state. The owning session's
/// receive loop is the only writer; the checkpoint path takes snapshots.
#[derive(Clone, Default, Debug)]
pub struct SharedPartitionState {
    inner: Arc<RwLock<StateCell>>,
}

#[derive(Default, Debug)]
struct StateCell {
    state: PartitionState,
    /// Whether a checkpoint-store read has populated this entry. Restoring
    /// runs at most once per process lifetime.
    restored: bool,
}

impl SharedPartitionState {
    /// Copy of the state at this instant. Taken without blocking the
    /// receive path beyond the copy itself.
    pub fn snapshot(&self) -> PartitionState {
        self.inner.read().state.clone()
    }

    pub fn offset(&self) -> Option<Offset> {
        self.inner.read().state.offset()
    }

    /// Attaches an auxiliary state key to be persisted with the next flush.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.write().state.insert(key, value);
    }

    pub(crate) fn record_offset(&self, offset: Offset) {
        self.inner.write().state.set_offset(offset);
    }

    pub(crate) fn seed(&self, state: PartitionState) {
        let mut cell = self.inner.write();
        cell.state = state;
        cell.restored = true;
    }

    pub(crate) fn is_restored(&self) -> bool {
        self.inner.read().restored
    }
}

/// A single partition's client-side session.
///
/// Lifecycle: `Created → (Restoring) → Subscribing → Subscribed →
/// Receiving`. Restoring runs only when a checkpoint store is attached and
/// no state has been loaded for this partition yet; teardown drops the
/// transport link, no explicit unsubscribe exists.
#[derive(Debug)]
pub struct PartitionSession<T, S = InMemoryCheckpointStore> {
    hub: Arc<HubConfig>,
    group: ConsumerGroup,
    partition_id: String,
    transport: T,
    store: Option<S>,
    state: SharedPartitionState,
    subscription: Option<Subscription>,
    subscribed: bool,
    receive_task: Option<JoinHandle<()>>,
}

impl<T: HubTransport, S: CheckpointStore> PartitionSession<T, S> {
    pub(crate) fn new(
        hub: Arc<HubConfig>,
        group: ConsumerGroup,
        partition_id: String,
        transport: T,
        store: Option<S>,
        state: SharedPartitionState,
    ) -> Self {
        PartitionSession {
            hub,
            group,
            partition_id,
            transport,
            store,
            state,
            subscription: None,
            subscribed: false,
            receive_task: None,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    pub fn state(&self) -> &SharedPartitionState {
        &self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Attaches a checkpoint store. Configure before subscribing so the
    /// restored offset can seed the subscription filter.
    pub fn with_store<S2: CheckpointStore>(self, store: S2) -> PartitionSession<T, S2> {
        PartitionSession {
            hub: self.hub,
            group: self.group,
            partition_id: self.partition_id,
            transport: self.transport,
            store: Some(store),
            state: self.state,
            subscription: self.subscription,
            subscribed: self.subscribed,
            receive_task: self.receive_task,
        }
    }

    /// Loads prior checkpoint state when a store is attached and nothing
    /// has been loaded yet; no-op otherwise.
    async fn restore(&mut self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        if self.state.is_restored() {
            return Ok(());
        }
        let namespace = CheckpointNamespace::new(&self.hub, &self.group);
        let ids = [self.partition_id.clone()];
        let mut loaded = store.get(&namespace, &ids).await?;
        let state = loaded.remove(&self.partition_id).unwrap_or_default();
        debug!(partition_id = %self.partition_id, offset = ?state.offset(), "Restored partition state");
        self.state.seed(state);
        Ok(())
    }

    /// Opens the partition's receive link. When the restored state holds an
    /// offset, the broker is asked to deliver only messages strictly after
    /// it; already-seen messages are filtered server-side, never by the
    /// client. Idempotent: a second call while subscribed keeps the
    /// existing link.
    pub async fn subscribe(&mut self) -> Result<()> {
        if self.subscribed {
            return Ok(());
        }
        self.restore().await?;
        let filter = self.state.offset().map(SelectorFilter::after_offset);
        let uri = self.hub.subscribe_uri(&self.group, &self.partition_id);
        debug!(
            partition_id = %self.partition_id,
            filter = filter.as_ref().map(SelectorFilter::expression),
            "Subscribing to partition"
        );
        let subscription = self.transport.subscribe(&uri, filter).await?;
        self.subscription = Some(subscription);
        self.subscribed = true;
        Ok(())
    }

    /// Starts the long-lived receive loop, forwarding each message to
    /// `events_tx`. Subscribes first when not yet subscribed. For every
    /// inbound message the broker offset annotation is recorded in the
    /// session state before the event is forwarded; messages stamped with a
    /// foreign partition id are dropped silently, and transport errors are
    /// forwarded per message without stopping the loop.
    pub async fn receive(&mut self, events_tx: mpsc::Sender<Result<Event>>) -> Result<()> {
        if !self.subscribed {
            self.subscribe().await?;
        }
        let Some(mut subscription) = self.subscription.take() else {
            return Err(Error::ReceiveTransport(format!(
                "receive loop already running for partition {}",
                self.partition_id
            )));
        };
        let partition_id = self.partition_id.clone();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(message) => {
                        if message.partition_id != partition_id {
                            continue;
                        }
                        let offset = message.offset();
                        if let Some(offset) = offset.clone() {
                            state.record_offset(offset);
                        }
                        let event = Event {
                            partition_id: partition_id.clone(),
                            payload: message.payload,
                            offset,
                        };
                        if events_tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if events_tx.send(Err(err)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(partition_id = %partition_id, "Partition receive loop ended");
        });
        self.receive_task = Some(handle);
        Ok(())
    }

    /// Sends one message to this partition's dedicated address. Keyed
    /// routing is a consumer-group concern; supplying a partition key on a
    /// pinned partition fails with [`Error::SendUnsupported`].
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if message.partition_key.is_some() {
            return Err(Error::SendUnsupported(
                "partition key routing is not available on a pinned partition".to_string(),
            ));
        }
        self.transport
            .send(&self.hub.partition_send_uri(&self.partition_id), message)
            .await
    }

    /// Persists this partition's state when a store is attached and the
    /// state is non-empty; calls through with no I/O otherwise. The flush
    /// works on a snapshot taken at call time, so a message received while
    /// the put is in flight lands in the next flush.
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let snapshot = self.state.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let namespace = CheckpointNamespace::new(&self.hub, &self.group);
        store
            .put(
                &namespace,
                vec![CheckpointEntry {
                    id: self.partition_id.clone(),
                    state: snapshot,
                }],
            )
            .await
    }

    /// Drops the transport link and stops the receive loop, if any.
    pub(crate) fn close(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        self.subscription = None;
        self.subscribed = false;
    }
}
