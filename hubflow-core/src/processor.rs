//! Consumer-group fan-out/fan-in: one session per partition, bulk
//! subscribe, interleaved receive, round-robin and keyed send, and
//! aggregate checkpointing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::checkpoint::in_memory_store::InMemoryCheckpointStore;
use crate::checkpoint::{CheckpointEntry, CheckpointNamespace, CheckpointStore, PartitionState};
use crate::config::{CheckpointConfig, ConsumerGroup, HubConfig};
use crate::directory::{PartitionDirectory, PartitionLister};
use crate::message::{Event, OutboundMessage};
use crate::scheduler::CheckpointScheduler;
use crate::session::{PartitionSession, SharedPartitionState};
use crate::transport::HubTransport;
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Cheap handle carrying everything a checkpoint flush needs: the store,
/// the namespace, and the state table entries. Cloned into the scheduler
/// task so flushing never touches the processor or the receive path.
#[derive(Clone)]
pub(crate) struct StateFlusher<S> {
    namespace: CheckpointNamespace,
    store: S,
    states: Arc<Vec<(String, SharedPartitionState)>>,
}

impl<S: CheckpointStore> StateFlusher<S> {
    /// Persists every non-empty state snapshot in one batched put. Returns
    /// the number of entries written; zero entries means no store I/O
    /// happened at all.
    pub(crate) async fn flush(&self) -> Result<usize> {
        let entries: Vec<CheckpointEntry> = self
            .states
            .iter()
            .filter_map(|(id, state)| {
                let snapshot = state.snapshot();
                (!snapshot.is_empty()).then(|| CheckpointEntry {
                    id: id.clone(),
                    state: snapshot,
                })
            })
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }
        let count = entries.len();
        self.store.put(&self.namespace, entries).await?;
        Ok(count)
    }
}

/// Coordinates one consumer group's partition sessions.
///
/// The partition set is resolved once at [`init`](Self::init) and never
/// rebalanced afterwards; a changed upstream layout needs a new directory
/// and a new processor.
pub struct GroupProcessor<T, L, S = InMemoryCheckpointStore> {
    hub: Arc<HubConfig>,
    group: ConsumerGroup,
    transport: T,
    directory: Arc<PartitionDirectory<L>>,
    store: Option<S>,
    checkpoint: CheckpointConfig,
    sessions: HashMap<String, PartitionSession<T, S>>,
    /// Partition ids in round-robin order, fixed at init.
    order: Vec<String>,
    send_cursor: usize,
    flusher: Option<StateFlusher<S>>,
    scheduler: Option<CheckpointScheduler>,
    initialized: bool,
}

impl<T: HubTransport, L: PartitionLister> GroupProcessor<T, L, InMemoryCheckpointStore> {
    /// Processor without a checkpoint store: offsets live in memory only.
    pub fn new(
        hub: Arc<HubConfig>,
        group: Option<&str>,
        transport: T,
        directory: Arc<PartitionDirectory<L>>,
    ) -> Self {
        GroupProcessor {
            hub,
            group: ConsumerGroup::normalize(group),
            transport,
            directory,
            store: None,
            checkpoint: CheckpointConfig::default(),
            sessions: HashMap::new(),
            order: Vec::new(),
            send_cursor: 0,
            flusher: None,
            scheduler: None,
            initialized: false,
        }
    }
}

impl<T: HubTransport, L: PartitionLister, S: CheckpointStore> GroupProcessor<T, L, S> {
    /// Attaches a checkpoint store and flush configuration. Configure
    /// before `init`; the store seeds session state during initialization.
    pub fn with_store<S2: CheckpointStore>(
        self,
        store: S2,
        checkpoint: CheckpointConfig,
    ) -> GroupProcessor<T, L, S2> {
        GroupProcessor {
            hub: self.hub,
            group: self.group,
            transport: self.transport,
            directory: self.directory,
            store: Some(store),
            checkpoint,
            sessions: HashMap::new(),
            order: Vec::new(),
            send_cursor: 0,
            flusher: None,
            scheduler: None,
            initialized: false,
        }
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Partition ids in round-robin order; empty before `init`.
    pub fn partition_ids(&self) -> &[String] {
        &self.order
    }

    /// Snapshot of one partition's current in-memory state.
    pub fn partition_state(&self, partition_id: &str) -> Option<PartitionState> {
        self.sessions
            .get(partition_id)
            .map(|session| session.state().snapshot())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Resolves the group's partitions, seeds session state from the
    /// checkpoint store when one is configured (one bulk get across all
    /// partitions), and constructs one session per partition. Also starts
    /// the checkpoint scheduler when a store is attached and the flush
    /// interval is non-zero. Every other method fails with
    /// [`Error::NotInitialized`] until this completes. A second call on an
    /// initialized processor is a no-op.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let partitions = self.directory.discover(&self.group).await?;
        let ids: Vec<String> = partitions.iter().map(|p| p.id.clone()).collect();

        let mut seeded: HashMap<String, PartitionState> = HashMap::new();
        if let Some(store) = &self.store {
            let namespace = CheckpointNamespace::new(&self.hub, &self.group);
            seeded = store.get(&namespace, &ids).await?;
        }

        let mut states = Vec::with_capacity(ids.len());
        for id in &ids {
            let state = SharedPartitionState::default();
            if self.store.is_some() {
                state.seed(seeded.remove(id).unwrap_or_default());
            }
            states.push((id.clone(), state.clone()));
            let session = PartitionSession::new(
                Arc::clone(&self.hub),
                self.group.clone(),
                id.clone(),
                self.transport.clone(),
                self.store.clone(),
                state,
            );
            self.sessions.insert(id.clone(), session);
        }

        if let Some(store) = &self.store {
            let flusher = StateFlusher {
                namespace: CheckpointNamespace::new(&self.hub, &self.group),
                store: store.clone(),
                states: Arc::new(states),
            };
            if !self.checkpoint.flush_interval.is_zero() {
                self.scheduler = Some(CheckpointScheduler::start(
                    flusher.clone(),
                    self.checkpoint.flush_interval,
                ));
            }
            self.flusher = Some(flusher);
        }

        self.order = ids;
        self.send_cursor = 0;
        self.initialized = true;
        info!(
            group = %self.group,
            partitions = self.order.len(),
            "Initialized consumer group processor"
        );
        Ok(())
    }

    /// Subscribes every session sequentially with fail-fast: the first
    /// failure aborts the remaining subscriptions and is reported alone. A
    /// group with an unsubscribable partition is unsafe to run partially.
    pub async fn subscribe_all(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        for id in &self.order {
            let session = self
                .sessions
                .get_mut(id)
                .expect("session map matches partition order");
            session.subscribe().await?;
        }
        Ok(())
    }

    /// Subscribes all sessions when needed, then starts each session's
    /// receive loop. Returns one stream of interleaved events from all
    /// partitions: ordering across partitions is unspecified, ordering
    /// within one partition is preserved.
    pub async fn receive_all(&mut self) -> Result<ReceiverStream<Result<Event>>> {
        self.ensure_initialized()?;
        let all_subscribed = self.sessions.values().all(PartitionSession::is_subscribed);
        if !all_subscribed {
            self.subscribe_all().await?;
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for id in &self.order {
            let session = self
                .sessions
                .get_mut(id)
                .expect("session map matches partition order");
            session.receive(tx.clone()).await?;
        }
        Ok(ReceiverStream::new(rx))
    }

    /// Sends one message. With a partition key the broker's server-side
    /// keyed routing is used, bypassing the round-robin cursor; without one
    /// the group's partitions are visited round-robin. Neither path gives a
    /// cross-partition ordering guarantee, and there is no back-pressure:
    /// callers outpacing the transport must throttle themselves.
    pub async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        self.ensure_initialized()?;
        if message.partition_key.is_some() {
            return self.transport.send(&self.hub.hub_send_uri(), message).await;
        }
        let id = self
            .order
            .get(self.send_cursor)
            .expect("send cursor wraps within the session count")
            .clone();
        self.send_cursor = (self.send_cursor + 1) % self.order.len();
        let session = self
            .sessions
            .get(&id)
            .expect("session map matches partition order");
        session.send(message).await
    }

    /// Persists every session's non-empty state in one batched put; a cycle
    /// with nothing dirty performs no store I/O. The scheduler calls this
    /// on its interval; manual calls surface the failure to the caller.
    pub async fn flush_all(&self) -> Result<()> {
        self.ensure_initialized()?;
        if let Some(flusher) = &self.flusher {
            flusher.flush().await?;
        }
        Ok(())
    }

    /// Flushes once, stops the scheduler, aborts the receive loops, and
    /// releases the transport links. Idempotent: tearing down an
    /// uninitialized processor is a no-op.
    pub async fn teardown(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        if let Some(flusher) = &self.flusher
            && let Err(err) = flusher.flush().await
        {
            error!(?err, "Final checkpoint flush failed during teardown");
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
        self.order.clear();
        self.flusher = None;
        self.send_cursor = 0;
        self.initialized = false;
        info!(group = %self.group, "Consumer group processor torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::config::SharedAccessPolicy;
    use crate::message::Offset;
    use crate::transport::in_memory::InMemoryHub;
    use crate::transport::{SelectorFilter, Subscription};

    fn test_hub_config() -> Arc<HubConfig> {
        Arc::new(HubConfig {
            namespace: "contoso".to_string(),
            hub_name: "telemetry".to_string(),
            policy: SharedAccessPolicy {
                name: "listen".to_string(),
                key: "secret".to_string(),
            },
        })
    }

    fn processor(
        broker: &InMemoryHub,
    ) -> GroupProcessor<InMemoryHub, InMemoryHub, InMemoryCheckpointStore> {
        GroupProcessor::new(
            test_hub_config(),
            None,
            broker.clone(),
            Arc::new(PartitionDirectory::new(broker.clone())),
        )
    }

    fn namespace() -> CheckpointNamespace {
        CheckpointNamespace::new(&test_hub_config(), &ConsumerGroup::default())
    }

    #[tokio::test]
    async fn test_methods_fail_before_init() {
        let broker = InMemoryHub::with_partitions(2);
        let mut processor = processor(&broker);
        assert!(matches!(
            processor.subscribe_all().await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            processor.receive_all().await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            processor.send(OutboundMessage::new("m")).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            processor.flush_all().await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_round_robin_send_distribution() {
        let broker = InMemoryHub::with_partitions(3);
        let mut processor = processor(&broker);
        processor.init().await.unwrap();

        // Calls 0..7 must land on partitions 0,1,2,0,1,2,0.
        for _ in 0..7 {
            processor.send(OutboundMessage::new("m")).await.unwrap();
        }
        assert_eq!(broker.message_count("0"), Some(3));
        assert_eq!(broker.message_count("1"), Some(2));
        assert_eq!(broker.message_count("2"), Some(2));
    }

    #[tokio::test]
    async fn test_keyed_send_bypasses_round_robin() {
        // Probe an identical hub to learn where the key hashes to.
        let probe = InMemoryHub::with_partitions(3);
        probe
            .send(
                &test_hub_config().hub_send_uri(),
                OutboundMessage::new("probe").with_partition_key("device-1"),
            )
            .await
            .unwrap();
        let keyed_partition = (0..3)
            .map(|id| id.to_string())
            .find(|id| probe.message_count(id) == Some(1))
            .unwrap();

        let broker = InMemoryHub::with_partitions(3);
        let mut processor = processor(&broker);
        processor.init().await.unwrap();

        processor.send(OutboundMessage::new("a")).await.unwrap();
        processor
            .send(OutboundMessage::new("k").with_partition_key("device-1"))
            .await
            .unwrap();
        // The keyed send left the cursor untouched: the next keyless send
        // lands on partition 1, not 2.
        processor.send(OutboundMessage::new("b")).await.unwrap();

        let mut expected = HashMap::from([
            ("0".to_string(), 1usize),
            ("1".to_string(), 1),
            ("2".to_string(), 0),
        ]);
        *expected.get_mut(&keyed_partition).unwrap() += 1;
        for (partition, count) in expected {
            assert_eq!(broker.message_count(&partition), Some(count));
        }
    }

    #[tokio::test]
    async fn test_receive_updates_partition_state() {
        let broker = InMemoryHub::with_partitions(2);
        let mut processor =
            processor(&broker).with_store(InMemoryCheckpointStore::new(), CheckpointConfig {
                flush_interval: Duration::ZERO,
            });
        processor.init().await.unwrap();
        let mut events = processor.receive_all().await.unwrap();

        let send_uri = test_hub_config().partition_send_uri("1");
        for body in ["a", "b", "c", "d"] {
            broker
                .send(&send_uri, OutboundMessage::new(body))
                .await
                .unwrap();
        }
        broker
            .send(&send_uri, OutboundMessage::new(r#"{"test":"message"}"#))
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..5 {
            last = Some(
                timeout(Duration::from_secs(1), events.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert_eq!(last.partition_id, "1");
        assert_eq!(last.payload, Bytes::from(r#"{"test":"message"}"#));
        assert_eq!(last.offset, Some(Offset::from("5")));
        assert_eq!(
            processor.partition_state("1").unwrap().offset(),
            Some(Offset::from("5"))
        );
        // The other partition saw nothing and stays clean.
        assert!(processor.partition_state("0").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_seeds_subscription_filters_from_store() {
        let broker = InMemoryHub::with_partitions(2);
        for (partition, backlog) in [("0", 10u64), ("1", 20u64)] {
            let send_uri = test_hub_config().partition_send_uri(partition);
            for _ in 0..backlog {
                broker
                    .send(&send_uri, OutboundMessage::new("old"))
                    .await
                    .unwrap();
            }
        }

        let store = InMemoryCheckpointStore::new();
        for (partition, offset) in [("0", "10"), ("1", "20")] {
            let mut state = PartitionState::new();
            state.set_offset(Offset::from(offset));
            store.preload(&namespace(), partition, state);
        }

        let mut processor = processor(&broker).with_store(store, CheckpointConfig {
            flush_interval: Duration::ZERO,
        });
        processor.init().await.unwrap();
        let mut events = processor.receive_all().await.unwrap();

        // Nothing at or below the checkpoints is replayed; fresh messages
        // arrive with the next offsets.
        broker
            .send(
                &test_hub_config().partition_send_uri("0"),
                OutboundMessage::new("new-0"),
            )
            .await
            .unwrap();
        broker
            .send(
                &test_hub_config().partition_send_uri("1"),
                OutboundMessage::new("new-1"),
            )
            .await
            .unwrap();

        let mut offsets = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(1), events.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            offsets.push((event.partition_id, event.offset.unwrap()));
        }
        offsets.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            offsets,
            vec![
                ("0".to_string(), Offset::from("11")),
                ("1".to_string(), Offset::from("21"))
            ]
        );
        assert!(
            timeout(Duration::from_millis(100), events.next())
                .await
                .is_err(),
            "no replayed event expected"
        );
    }

    #[tokio::test]
    async fn test_flush_all_batches_dirty_sessions() {
        let broker = InMemoryHub::with_partitions(3);
        let store = InMemoryCheckpointStore::new();
        let mut processor = processor(&broker).with_store(store.clone(), CheckpointConfig {
            flush_interval: Duration::ZERO,
        });
        processor.init().await.unwrap();

        // Nothing dirty: flush succeeds without store I/O.
        processor.flush_all().await.unwrap();
        assert_eq!(store.put_calls(), 0);

        let mut events = processor.receive_all().await.unwrap();
        for partition in ["0", "2"] {
            broker
                .send(
                    &test_hub_config().partition_send_uri(partition),
                    OutboundMessage::new("m"),
                )
                .await
                .unwrap();
        }
        for _ in 0..2 {
            let _ = timeout(Duration::from_secs(1), events.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        // Two dirty sessions: exactly one put covering both.
        processor.flush_all().await.unwrap();
        assert_eq!(store.put_calls(), 1);
        assert_eq!(
            store.record(&namespace(), "0").unwrap().offset(),
            Some(Offset::from("1"))
        );
        assert_eq!(
            store.record(&namespace(), "2").unwrap().offset(),
            Some(Offset::from("1"))
        );
        assert!(store.record(&namespace(), "1").is_none());
    }

    #[tokio::test]
    async fn test_scheduler_flushes_and_stops_on_teardown() {
        let broker = InMemoryHub::with_partitions(1);
        let store = InMemoryCheckpointStore::new();
        let mut processor = processor(&broker).with_store(store.clone(), CheckpointConfig {
            flush_interval: Duration::from_millis(50),
        });
        processor.init().await.unwrap();
        let mut events = processor.receive_all().await.unwrap();

        broker
            .send(
                &test_hub_config().partition_send_uri("0"),
                OutboundMessage::new("m"),
            )
            .await
            .unwrap();
        let _ = timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.put_calls() >= 1);
        assert_eq!(
            store.record(&namespace(), "0").unwrap().offset(),
            Some(Offset::from("1"))
        );

        processor.teardown().await.unwrap();
        let calls_after_teardown = store.put_calls();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.put_calls(), calls_after_teardown);
    }

    #[derive(Clone)]
    struct FailingStore;

    impl CheckpointStore for FailingStore {
        async fn put(
            &self,
            _namespace: &CheckpointNamespace,
            _entries: Vec<CheckpointEntry>,
        ) -> Result<()> {
            Err(Error::Persist("injected failure".to_string()))
        }

        async fn get(
            &self,
            _namespace: &CheckpointNamespace,
            partition_ids: &[String],
        ) -> Result<HashMap<String, PartitionState>> {
            Ok(partition_ids
                .iter()
                .map(|id| (id.clone(), PartitionState::default()))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_manual_flush_surfaces_store_failure() {
        let broker = InMemoryHub::with_partitions(1);
        let mut processor = processor(&broker).with_store(FailingStore, CheckpointConfig {
            flush_interval: Duration::ZERO,
        });
        processor.init().await.unwrap();
        let mut events = processor.receive_all().await.unwrap();

        broker
            .send(
                &test_hub_config().partition_send_uri("0"),
                OutboundMessage::new("m"),
            )
            .await
            .unwrap();
        let _ = timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let err = processor.flush_all().await.unwrap_err();
        assert!(matches!(err, Error::Persist(_)));
    }

    #[derive(Clone)]
    struct FailingGetStore;

    impl CheckpointStore for FailingGetStore {
        async fn put(
            &self,
            _namespace: &CheckpointNamespace,
            _entries: Vec<CheckpointEntry>,
        ) -> Result<()> {
            Ok(())
        }

        async fn get(
            &self,
            _namespace: &CheckpointNamespace,
            _partition_ids: &[String],
        ) -> Result<HashMap<String, PartitionState>> {
            Err(Error::Retrieve("table service unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_init_surfaces_retrieve_failure() {
        let broker = InMemoryHub::with_partitions(1);
        let mut processor = processor(&broker).with_store(FailingGetStore, CheckpointConfig::default());
        let err = processor.init().await.unwrap_err();
        assert!(matches!(err, Error::Retrieve(_)));
        assert!(!processor.is_initialized());
    }

    #[derive(Clone)]
    struct RejectingTransport {
        inner: InMemoryHub,
        reject_partition: String,
    }

    impl HubTransport for RejectingTransport {
        async fn subscribe(
            &self,
            source_uri: &str,
            filter: Option<SelectorFilter>,
        ) -> Result<Subscription> {
            if source_uri.ends_with(&format!("/Partitions/{}", self.reject_partition)) {
                return Err(Error::Subscribe("link refused by broker".to_string()));
            }
            self.inner.subscribe(source_uri, filter).await
        }

        async fn send(&self, address: &str, message: OutboundMessage) -> Result<()> {
            self.inner.send(address, message).await
        }
    }

    #[tokio::test]
    async fn test_subscribe_all_fails_fast() {
        let broker = InMemoryHub::with_partitions(3);
        let transport = RejectingTransport {
            inner: broker.clone(),
            reject_partition: "1".to_string(),
        };
        let mut processor = GroupProcessor::new(
            test_hub_config(),
            None,
            transport,
            Arc::new(PartitionDirectory::new(broker.clone())),
        );
        processor.init().await.unwrap();

        let err = processor.subscribe_all().await.unwrap_err();
        assert!(matches!(err, Error::Subscribe(_)));
        // Partition 0 got its link, 1 was refused, 2 was never attempted.
        assert_eq!(broker.subscriber_count("0"), Some(1));
        assert_eq!(broker.subscriber_count("1"), Some(0));
        assert_eq!(broker.subscriber_count("2"), Some(0));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let broker = InMemoryHub::with_partitions(2);
        let mut processor = processor(&broker);
        processor.init().await.unwrap();
        processor.teardown().await.unwrap();
        assert!(!processor.is_initialized());
        processor.teardown().await.unwrap();
        assert!(matches!(
            processor.send(OutboundMessage::new("m")).await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_teardown_flushes_once() {
        let broker = InMemoryHub::with_partitions(1);
        let store = InMemoryCheckpointStore::new();
        let mut processor = processor(&broker).with_store(store.clone(), CheckpointConfig {
            flush_interval: Duration::ZERO,
        });
        processor.init().await.unwrap();
        let mut events = processor.receive_all().await.unwrap();

        broker
            .send(
                &test_hub_config().partition_send_uri("0"),
                OutboundMessage::new("m"),
            )
            .await
            .unwrap();
        let _ = timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        processor.teardown().await.unwrap();
        assert_eq!(store.put_calls(), 1);
        assert_eq!(
            store.record(&namespace(), "0").unwrap().offset(),
            Some(Offset::from("1"))
        );
    }
}
