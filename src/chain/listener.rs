//! Per-chain event listener
//!
//! Polls the bridge contract's logs from the persisted cursor, decodes them,
//! holds events that need confirmations in a [`FinalityGate`], and hands
//! final events to the [`Outbox`] (append to the event store, publish the
//! task, mark published). The persisted cursor never passes the lowest block
//! still waiting for finality, so a restart re-observes everything pending.

use super::{FinalityGate, LedgerClient};
use crate::broker::Broker;
use crate::config::ListenerConfig;
use crate::coordination::{machine, Task};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, Event, EventDecoder, EventKey};
use crate::metrics;
use crate::state::{AppendOutcome, ChainCursor, EventStore};

use ethers::types::{Address, H256};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Block range sizing for `get_logs`.
///
/// Grows after chunks with no events, resets to the minimum once events show
/// up, and shrinks when the node rejects or times out a request.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: f64,
    min: u64,
    max: u64,
    increase: f64,
    decrease: f64,
}

impl ChunkSizer {
    pub fn new(config: &ListenerConfig) -> Self {
        Self {
            current: config.start_chunk_size as f64,
            min: config.min_chunk_size.max(1),
            max: config.max_chunk_size.max(1),
            increase: config.chunk_size_increase,
            decrease: config.chunk_size_decrease,
        }
    }

    pub fn size(&self) -> u64 {
        (self.current as u64).clamp(self.min, self.max)
    }

    pub fn on_chunk(&mut self, found_events: bool) {
        self.current = if found_events {
            self.min as f64
        } else {
            self.current * self.increase
        };
        self.clamp();
    }

    pub fn on_error(&mut self) {
        self.current *= self.decrease;
        self.clamp();
    }

    fn clamp(&mut self) {
        self.current = self.current.clamp(self.min as f64, self.max as f64);
    }
}

/// Where an observed event stands in the event store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    New,
    /// Stored, but its task was never published
    Unpublished,
    Published,
}

/// Durable hand-off of final events: store, then publish, then mark published
pub struct Outbox {
    store: Arc<EventStore>,
    broker: Arc<dyn Broker>,
    queue: String,
}

impl Outbox {
    pub fn new(store: Arc<EventStore>, broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            store,
            broker,
            queue: queue.into(),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub async fn seen(&self, key: &EventKey) -> RelayerResult<Seen> {
        if !self.store.exists(key).await? {
            Ok(Seen::New)
        } else if self.store.is_published(key).await? {
            Ok(Seen::Published)
        } else {
            Ok(Seen::Unpublished)
        }
    }

    /// Append the event and publish its task
    pub async fn deliver(&self, event: &Event) -> RelayerResult<()> {
        let task = Task::from_event(event)?;

        if self.store.append(event).await? == AppendOutcome::Duplicate {
            debug!("Event {} already stored, republishing its task", event.key());
        }
        self.broker.publish(&self.queue, &task.encode()?, None).await?;
        self.store.mark_published(&event.key()).await?;

        metrics::record_task_published(event.chain_id, event.event_type);
        info!(
            "Chain {}: published {} for operation {}",
            event.chain_id,
            event.event_type,
            event.operation_id()
        );
        Ok(())
    }
}

/// Result of one listener cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Block range scanned, if any
    pub scanned: Option<(u64, u64)>,
    pub published: usize,
    /// Nothing left to scan up to the chain head
    pub caught_up: bool,
}

/// Listens for bridge contract events on one chain
pub struct EventListener {
    chain_id: ChainId,
    ledger: Arc<dyn LedgerClient>,
    contract: Address,
    decoder: EventDecoder,
    topics: Vec<H256>,
    outbox: Outbox,
    config: ListenerConfig,
    gate: FinalityGate,
    chunk: ChunkSizer,
    /// Highest block fetched this run; may be ahead of the persisted cursor
    scanned_to: Option<u64>,
    consecutive_decode_failures: u32,
}

impl EventListener {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        contract: Address,
        decoder: EventDecoder,
        confirmation_depth: u64,
        outbox: Outbox,
        config: ListenerConfig,
    ) -> Self {
        let chain_id = ledger.chain_id();
        Self {
            chain_id,
            ledger,
            contract,
            topics: decoder.topics(),
            decoder,
            outbox,
            gate: FinalityGate::new(chain_id, confirmation_depth),
            chunk: ChunkSizer::new(&config),
            config,
            scanned_to: None,
            consecutive_decode_failures: 0,
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Persisted cursor for this chain, or one just before `start_block`
    pub async fn load_cursor(&self, start_block: u64) -> RelayerResult<ChainCursor> {
        match self.outbox.store().load_cursor(self.chain_id).await? {
            Some(cursor) => {
                info!(
                    "Chain {}: resuming after block {}",
                    self.chain_id, cursor.last_processed_block
                );
                Ok(cursor)
            }
            None => {
                info!("Chain {}: no cursor, starting at block {}", self.chain_id, start_block);
                Ok(ChainCursor::new(self.chain_id, start_block.saturating_sub(1)))
            }
        }
    }

    /// Main listening loop
    pub async fn run(
        mut self,
        mut cursor: ChainCursor,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        info!(
            "Chain {}: listener started after block {}",
            self.chain_id, cursor.last_processed_block
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once(&mut cursor).await {
                Ok(outcome) => outcome.caught_up,
                Err(e) if e.is_fatal() => {
                    metrics::raise_alert(
                        "listener_storage",
                        &format!("Chain {} listener stopping: {}", self.chain_id, e),
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!("Chain {}: poll failed: {}", self.chain_id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "Chain {}: listener stopped at block {} ({} events pending finality)",
            self.chain_id,
            cursor.last_processed_block,
            self.gate.len()
        );
        Ok(())
    }

    /// Scan the next chunk, release newly final events and persist the cursor.
    ///
    /// On error the persisted cursor is left where it was.
    pub async fn poll_once(&mut self, cursor: &mut ChainCursor) -> RelayerResult<PollOutcome> {
        let ledger = self.ledger.as_ref();
        let latest = self
            .config
            .retry
            .retry("latest_block", move || ledger.latest_block())
            .await?;

        let from = self.scanned_to.unwrap_or(cursor.last_processed_block) + 1;
        let mut outcome = PollOutcome::default();

        if from <= latest {
            let to = latest.min(from + self.chunk.size() - 1);
            let (contract, topics) = (self.contract, self.topics.as_slice());

            let logs = match self
                .config
                .retry
                .retry("get_logs", move || ledger.get_logs(from, to, contract, topics))
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    self.chunk.on_error();
                    return Err(e);
                }
            };

            debug!(
                "Chain {}: processing blocks {} to {} ({} logs)",
                self.chain_id,
                from,
                to,
                logs.len()
            );

            let found_events = !logs.is_empty();
            for raw in logs {
                let event = match self.decoder.decode(&raw) {
                    Ok((event_type, payload)) => {
                        self.consecutive_decode_failures = 0;
                        Event::from_raw(&raw, event_type, payload)
                    }
                    Err(e) => {
                        self.on_decode_error(raw.key(), e);
                        continue;
                    }
                };
                outcome.published += self.observe(event, latest).await?;
            }

            self.scanned_to = Some(to);
            self.chunk.on_chunk(found_events);
            outcome.scanned = Some((from, to));
            metrics::record_blocks_processed(self.chain_id, to);
        }

        outcome.published += self.release_final(latest).await?;
        outcome.caught_up = self.scanned_to.map_or(true, |scanned| scanned >= latest);

        self.persist_cursor(cursor).await?;
        Ok(outcome)
    }

    /// Route one decoded event; returns the number of tasks published
    async fn observe(&mut self, event: Event, latest: u64) -> RelayerResult<usize> {
        metrics::record_event_observed(self.chain_id, event.event_type);

        match self.outbox.seen(&event.key()).await? {
            Seen::Published => {
                debug!("Chain {}: skipping duplicate {}", self.chain_id, event.key());
                return Ok(0);
            }
            Seen::Unpublished => {
                warn!(
                    "Chain {}: {} was stored but never published, republishing",
                    self.chain_id,
                    event.key()
                );
                self.outbox.deliver(&event).await?;
                return Ok(1);
            }
            Seen::New => {}
        }

        // Reject events the protocol does not emit from this chain's role
        if let Err(e) = Task::from_event(&event) {
            if e.should_alert() {
                metrics::raise_alert(
                    "unexpected_origin",
                    &format!("Chain {}: {} skipped: {}", self.chain_id, event.key(), e),
                );
            } else {
                warn!("Chain {}: {} skipped: {}", self.chain_id, event.key(), e);
            }
            return Ok(0);
        }

        if machine::requires_finality(event.event_type)
            && !self.gate.is_final(event.block_number, latest)
        {
            self.gate.hold(event);
            metrics::set_pending_finality(self.chain_id, self.gate.len());
            return Ok(0);
        }

        self.outbox.deliver(&event).await?;
        Ok(1)
    }

    /// Deliver held events that reached confirmation depth
    async fn release_final(&mut self, latest: u64) -> RelayerResult<usize> {
        let mut released = self.gate.release(latest).into_iter();
        let mut delivered = 0;

        while let Some(event) = released.next() {
            info!(
                "Chain {}: {} at block {} is final",
                self.chain_id, event.event_type, event.block_number
            );
            if let Err(e) = self.outbox.deliver(&event).await {
                self.gate.restore(std::iter::once(event).chain(released));
                metrics::set_pending_finality(self.chain_id, self.gate.len());
                return Err(e);
            }
            delivered += 1;
        }

        metrics::set_pending_finality(self.chain_id, self.gate.len());
        Ok(delivered)
    }

    /// Persist min(scanned, lowest pending - 1), never moving backwards
    async fn persist_cursor(&self, cursor: &mut ChainCursor) -> RelayerResult<()> {
        let Some(scanned) = self.scanned_to else {
            return Ok(());
        };
        let safe = match self.gate.lowest_pending_block() {
            Some(block) => scanned.min(block.saturating_sub(1)),
            None => scanned,
        };

        if safe > cursor.last_processed_block {
            *cursor = ChainCursor::new(self.chain_id, safe);
            self.outbox.store().save_cursor(cursor).await?;
            metrics::set_cursor(self.chain_id, safe);
        }
        Ok(())
    }

    fn on_decode_error(&mut self, key: EventKey, err: RelayerError) {
        match err {
            RelayerError::UnknownEvent(name) => {
                metrics::raise_alert(
                    "unknown_event",
                    &format!("Chain {}: {} is a non-protocol event {}", self.chain_id, key, name),
                );
            }
            other => {
                self.consecutive_decode_failures += 1;
                metrics::record_decode_failure(self.chain_id);
                warn!("Chain {}: skipping undecodable log {}: {}", self.chain_id, key, other);

                if self.consecutive_decode_failures >= self.config.max_consecutive_decode_failures {
                    metrics::raise_alert(
                        "decode_failures",
                        &format!(
                            "Chain {}: {} consecutive logs failed to decode",
                            self.chain_id, self.consecutive_decode_failures
                        ),
                    );
                    self.consecutive_decode_failures = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::chain::fake::FakeLedger;
    use crate::chain::MockLedgerClient;
    use crate::events::decoder::fixtures::{bridge_abi, params, raw_log};
    use crate::events::{EventPayload, EventType, OperationId, RawEvent};
    use crate::retry::RetryPolicy;
    use crate::state::{FailingKvStore, MemoryKvStore};
    use ethers::types::Bytes;

    const QUEUE: &str = "tasks";
    const FROM: ChainId = 1337;
    const TO: ChainId = 440;

    struct Harness {
        ledger: Arc<FakeLedger>,
        store: Arc<EventStore>,
        broker: MemoryBroker,
    }

    impl Harness {
        fn new(chain_id: ChainId) -> Self {
            Self {
                ledger: Arc::new(FakeLedger::new(chain_id)),
                store: Arc::new(EventStore::new(Arc::new(MemoryKvStore::new()))),
                broker: MemoryBroker::new(),
            }
        }

        fn listener(&self, depth: u64) -> EventListener {
            let config = ListenerConfig {
                max_consecutive_decode_failures: 3,
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff_ms: 10,
                    max_backoff_ms: 10,
                    multiplier: 2,
                },
                ..ListenerConfig::default()
            };
            EventListener::new(
                self.ledger.clone(),
                Address::repeat_byte(0xbb),
                EventDecoder::new(self.ledger.chain_id(), &bridge_abi()),
                depth,
                Outbox::new(self.store.clone(), Arc::new(self.broker.clone()), QUEUE),
                config,
            )
        }

        fn emit(&self, event_type: EventType, block: u64, log_index: u64) -> RawEvent {
            let raw = raw_log(
                &bridge_abi(),
                event_type,
                self.ledger.chain_id(),
                block,
                H256::from_low_u64_be(block * 100 + log_index),
                log_index,
                &payload(),
            );
            self.ledger.push_log(raw.clone());
            raw
        }

        async fn tasks(&self) -> Vec<Task> {
            let mut tasks = Vec::new();
            while let Some(delivery) = self.broker.try_next(QUEUE).await {
                tasks.push(Task::decode(&delivery.payload).unwrap());
            }
            tasks
        }
    }

    fn payload() -> EventPayload {
        EventPayload {
            operation_hash: OperationId::from([0x5a; 32]),
            params: params(FROM, TO, 4),
            block_step: 0,
        }
    }

    #[test]
    fn test_chunk_sizer() {
        let mut sizer = ChunkSizer::new(&ListenerConfig::default());
        assert_eq!(sizer.size(), 20);
        sizer.on_chunk(false);
        assert_eq!(sizer.size(), 40);
        sizer.on_chunk(true);
        assert_eq!(sizer.size(), 10);
        sizer.on_error();
        assert_eq!(sizer.size(), 10);

        for _ in 0..20 {
            sizer.on_chunk(false);
        }
        assert_eq!(sizer.size(), 10_000);
        sizer.on_error();
        assert_eq!(sizer.size(), 5_000);
    }

    #[tokio::test]
    async fn test_reingest_never_duplicates_task() {
        let h = Harness::new(TO);
        h.emit(EventType::FeesDepositConfirmed, 5, 0);

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        let outcome = listener.poll_once(&mut cursor).await.unwrap();
        assert_eq!(outcome.published, 1);
        assert_eq!(cursor.last_processed_block, 5);

        // A fresh listener rescanning from genesis sees the same log again
        let mut restarted = h.listener(0);
        let mut rewound = ChainCursor::new(TO, 0);
        assert_eq!(restarted.poll_once(&mut rewound).await.unwrap().published, 0);

        let tasks = h.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].event_type, EventType::FeesDepositConfirmed);
        assert_eq!(tasks[0].target_chain_id, Some(FROM));
        assert_eq!(
            h.store.operation_events(&payload().operation_hash).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stored_but_unpublished_event_is_republished() {
        let h = Harness::new(TO);
        let raw = h.emit(EventType::FeesDepositConfirmed, 3, 1);
        let decoder = EventDecoder::new(TO, &bridge_abi());
        let (event_type, payload) = decoder.decode(&raw).unwrap();
        // Crash between append and publish
        h.store
            .append(&Event::from_raw(&raw, event_type, payload))
            .await
            .unwrap();

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        assert_eq!(listener.poll_once(&mut cursor).await.unwrap().published, 1);
        assert!(h.store.is_published(&raw.key()).await.unwrap());
        assert_eq!(h.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finality_gate_publishes_exactly_once_at_depth() {
        let h = Harness::new(TO);
        h.emit(EventType::FeesDeposited, 10, 0);
        h.ledger.set_latest_block(11);

        let mut listener = h.listener(3);
        let mut cursor = ChainCursor::new(TO, 0);
        let outcome = listener.poll_once(&mut cursor).await.unwrap();
        assert_eq!(outcome.published, 0);
        assert_eq!(listener.gate.len(), 1);
        // Cursor is held just below the pending event
        assert_eq!(cursor.last_processed_block, 9);
        assert!(h.tasks().await.is_empty());

        h.ledger.set_latest_block(12);
        listener.poll_once(&mut cursor).await.unwrap();
        assert!(h.tasks().await.is_empty());

        h.ledger.set_latest_block(13);
        assert_eq!(listener.poll_once(&mut cursor).await.unwrap().published, 1);
        assert_eq!(cursor.last_processed_block, 13);
        assert_eq!(listener.gate.len(), 0);

        h.ledger.set_latest_block(20);
        listener.poll_once(&mut cursor).await.unwrap();
        assert_eq!(h.tasks().await.len(), 1);
        assert_eq!(
            h.store.load_cursor(TO).await.unwrap().unwrap().last_processed_block,
            20
        );
    }

    #[tokio::test]
    async fn test_restart_reobserves_pending_events() {
        let h = Harness::new(TO);
        h.emit(EventType::FeesDeposited, 10, 0);
        h.ledger.set_latest_block(11);

        let mut cursor = ChainCursor::new(TO, 0);
        h.listener(3).poll_once(&mut cursor).await.unwrap();

        h.ledger.set_latest_block(15);
        let mut restarted = h.listener(3);
        let mut cursor = restarted.load_cursor(0).await.unwrap();
        assert_eq!(cursor.last_processed_block, 9);
        assert_eq!(restarted.poll_once(&mut cursor).await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn test_undecodable_log_is_skipped() {
        let h = Harness::new(TO);
        let mut bad = raw_log(
            &bridge_abi(),
            EventType::FeesDepositConfirmed,
            TO,
            1,
            H256::repeat_byte(0xee),
            0,
            &payload(),
        );
        bad.data = Bytes::from(vec![0u8; 7]);
        h.ledger.push_log(bad);
        h.emit(EventType::FeesDepositConfirmed, 2, 0);

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        let outcome = listener.poll_once(&mut cursor).await.unwrap();

        assert_eq!(outcome.published, 1);
        // The good log after it ends the failure streak
        assert_eq!(listener.consecutive_decode_failures, 0);
        assert_eq!(cursor.last_processed_block, 2);
    }

    #[tokio::test]
    async fn test_consecutive_decode_failures_alert_and_reset() {
        let h = Harness::new(TO);
        for block in 1..=3 {
            let mut raw = raw_log(
                &bridge_abi(),
                EventType::FeesDepositConfirmed,
                TO,
                block,
                H256::from_low_u64_be(block),
                0,
                &payload(),
            );
            raw.data = Bytes::from(vec![0u8; 7]);
            h.ledger.push_log(raw);
        }

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        let outcome = listener.poll_once(&mut cursor).await.unwrap();
        assert_eq!(outcome.published, 0);
        // Cap of 3 reached: alert raised and the streak starts over
        assert_eq!(listener.consecutive_decode_failures, 0);
        assert_eq!(cursor.last_processed_block, 3);
    }

    #[tokio::test]
    async fn test_non_protocol_and_wrong_origin_events_are_skipped() {
        let h = Harness::new(TO);
        let abi = bridge_abi();
        let ownership = abi.event("OwnershipTransferred").unwrap();
        h.ledger.push_log(RawEvent {
            chain_id: TO,
            block_number: 2,
            tx_hash: H256::repeat_byte(0x99),
            log_index: 0,
            topics: vec![
                ownership.signature(),
                H256::from(Address::repeat_byte(1)),
                H256::from(Address::repeat_byte(2)),
            ],
            data: Bytes::new(),
        });
        // OperationCreated is only emitted on the from chain
        h.emit(EventType::OperationCreated, 3, 0);

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        let outcome = listener.poll_once(&mut cursor).await.unwrap();
        assert_eq!(outcome.published, 0);
        assert_eq!(cursor.last_processed_block, 3);
        assert!(h.tasks().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_rpc_error_leaves_cursor_untouched() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_chain_id().return_const(TO);
        ledger.expect_latest_block().returning(|| Ok(100));
        ledger.expect_get_logs().times(2).returning(|_, _, _, _| {
            Err(RelayerError::TransientNetwork {
                chain_id: TO,
                message: "timeout".into(),
            })
        });

        let store = Arc::new(EventStore::new(Arc::new(MemoryKvStore::new())));
        let mut listener = EventListener::new(
            Arc::new(ledger),
            Address::zero(),
            EventDecoder::new(TO, &bridge_abi()),
            0,
            Outbox::new(store.clone(), Arc::new(MemoryBroker::new()), QUEUE),
            ListenerConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff_ms: 100,
                    max_backoff_ms: 100,
                    multiplier: 2,
                },
                ..ListenerConfig::default()
            },
        );

        let mut cursor = ChainCursor::new(TO, 41);
        let err = listener.poll_once(&mut cursor).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cursor.last_processed_block, 41);
        assert!(store.load_cursor(TO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_error_then_recovery_rescans_same_range() {
        let h = Harness::new(TO);
        h.emit(EventType::FeesDepositConfirmed, 4, 0);
        h.ledger.fail_next_get_logs(2);

        let mut listener = h.listener(0);
        let mut cursor = ChainCursor::new(TO, 0);
        assert!(listener.poll_once(&mut cursor).await.is_err());
        assert_eq!(cursor.last_processed_block, 0);

        assert_eq!(listener.poll_once(&mut cursor).await.unwrap().published, 1);
        let calls = h.ledger.get_logs_calls();
        assert!(calls.iter().all(|(from, _)| *from == 1));
    }

    #[tokio::test]
    async fn test_storage_failure_stops_listener_with_cursor_unchanged() {
        let kv = Arc::new(FailingKvStore::new());
        let h = Harness {
            ledger: Arc::new(FakeLedger::new(TO)),
            store: Arc::new(EventStore::new(kv.clone())),
            broker: MemoryBroker::new(),
        };
        h.store.save_cursor(&ChainCursor::new(TO, 2)).await.unwrap();
        h.emit(EventType::FeesDepositConfirmed, 5, 0);
        kv.fail_writes(true);

        let (_stop, shutdown) = watch::channel(false);
        let err = h
            .listener(0)
            .run(ChainCursor::new(TO, 2), shutdown)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(
            h.store.load_cursor(TO).await.unwrap().unwrap().last_processed_block,
            2
        );
        assert!(h.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new(FROM);
        let (tx, rx) = watch::channel(false);
        let listener = h.listener(0);
        let handle = tokio::spawn(listener.run(ChainCursor::new(FROM, 0), rx));

        tx.send(true).unwrap();
        tokio_test::assert_ok!(handle.await.unwrap());
    }
}
