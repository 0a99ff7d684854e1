//! Full operation lifecycle across two fake chains: listeners publish tasks,
//! the dispatcher submits, and each submission makes the contract emit the
//! next protocol event.

use super::dispatcher::TaskOutcome;
use super::{Action, Task, TaskDispatcher};
use crate::broker::{Broker, MemoryBroker};
use crate::chain::fake::FakeLedger;
use crate::chain::listener::Outbox;
use crate::chain::{ChainRegistry, EventListener, LedgerClient};
use crate::config::{DispatcherConfig, ListenerConfig};
use crate::events::decoder::fixtures::{bridge_abi, params, raw_log};
use crate::events::{ChainId, EventDecoder, EventPayload, EventType, OperationId};
use crate::state::{ChainCursor, EventStore, MemoryKvStore};

use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const QUEUE: &str = "tasks";
const FROM: ChainId = 1337;
const TO: ChainId = 440;
const DEPTH: u64 = 2;

/// Event the bridge contract emits when `action` succeeds
fn emitted_by(action: Action) -> EventType {
    match action {
        Action::SendFeesLockConfirmation => EventType::FeesDepositConfirmed,
        Action::ReceiveFeesLockConfirmation => EventType::FeesLockedConfirmed,
        Action::ConfirmFeesLockedAndDepositConfirmed => EventType::FeesLockedAndDepositConfirmed,
        Action::CompleteOperation => EventType::OperationFinalized,
    }
}

/// Make `ledger` emit the follow-up event for every successful submission
fn emit_on_submit(ledger: &Arc<FakeLedger>, next_block: Arc<AtomicU64>) {
    let weak = Arc::downgrade(ledger);
    let chain_id = ledger.chain_id();
    ledger.on_submit(move |action, payload| {
        let Some(ledger) = weak.upgrade() else {
            return;
        };
        let block = next_block.fetch_add(1, Ordering::SeqCst);
        ledger.push_log(raw_log(
            &bridge_abi(),
            emitted_by(action),
            chain_id,
            block,
            H256::from_low_u64_be(chain_id * 10_000 + block),
            0,
            payload,
        ));
    });
}

struct Bridge {
    store: Arc<EventStore>,
    broker: MemoryBroker,
    from: Arc<FakeLedger>,
    to: Arc<FakeLedger>,
    dispatcher: TaskDispatcher,
}

impl Bridge {
    fn new() -> Self {
        let store = Arc::new(EventStore::new(Arc::new(MemoryKvStore::new())));
        let broker = MemoryBroker::new();
        let from = Arc::new(FakeLedger::new(FROM));
        let to = Arc::new(FakeLedger::new(TO));
        let next_block = Arc::new(AtomicU64::new(20));
        emit_on_submit(&from, next_block.clone());
        emit_on_submit(&to, next_block);

        let chains = ChainRegistry::new();
        chains.insert(from.clone());
        chains.insert(to.clone());

        let dispatcher = TaskDispatcher::new(
            store.clone(),
            Arc::new(chains),
            Arc::new(broker.clone()),
            QUEUE,
            DispatcherConfig::default(),
            "scenario",
        );
        Self {
            store,
            broker,
            from,
            to,
            dispatcher,
        }
    }

    fn listener(&self, ledger: &Arc<FakeLedger>, chain_id: ChainId) -> EventListener {
        EventListener::new(
            ledger.clone(),
            Address::repeat_byte(0xbb),
            EventDecoder::new(chain_id, &bridge_abi()),
            DEPTH,
            Outbox::new(self.store.clone(), Arc::new(self.broker.clone()), QUEUE),
            ListenerConfig::default(),
        )
    }

    /// Handle every ready task; returns the outcomes in order
    async fn drain(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.broker.try_next(QUEUE).await {
            outcomes.push(self.dispatcher.handle_delivery(delivery, "w0").await.unwrap());
        }
        outcomes
    }
}

fn payload() -> EventPayload {
    EventPayload {
        operation_hash: OperationId::from([0x77; 32]),
        params: params(FROM, TO, 9),
        block_step: 1,
    }
}

#[tokio::test]
async fn test_operation_runs_to_archival() {
    let bridge = Bridge::new();
    let op = payload().operation_hash;

    bridge.from.push_log(raw_log(
        &bridge_abi(),
        EventType::OperationCreated,
        FROM,
        1,
        H256::from_low_u64_be(1),
        0,
        &payload(),
    ));
    bridge.to.push_log(raw_log(
        &bridge_abi(),
        EventType::FeesDeposited,
        TO,
        3,
        H256::from_low_u64_be(3),
        0,
        &payload(),
    ));
    bridge.from.set_latest_block(10);
    bridge.to.set_latest_block(10);

    let mut from_listener = bridge.listener(&bridge.from, FROM);
    let mut to_listener = bridge.listener(&bridge.to, TO);
    let mut from_cursor = ChainCursor::new(FROM, 0);
    let mut to_cursor = ChainCursor::new(TO, 0);

    for _ in 0..10 {
        from_listener.poll_once(&mut from_cursor).await.unwrap();
        to_listener.poll_once(&mut to_cursor).await.unwrap();
        for outcome in bridge.drain().await {
            assert!(
                !matches!(
                    outcome,
                    TaskOutcome::DeadLettered { .. } | TaskOutcome::Rejected { .. }
                ),
                "unexpected outcome {:?}",
                outcome
            );
        }
        if bridge.store.is_archived(&op).await.unwrap() {
            break;
        }
    }

    assert!(bridge.store.is_archived(&op).await.unwrap());

    let actions = |ledger: &FakeLedger| -> Vec<Action> {
        ledger.submissions().into_iter().map(|(action, _)| action).collect()
    };
    assert_eq!(
        actions(&bridge.to),
        vec![Action::SendFeesLockConfirmation, Action::CompleteOperation]
    );
    assert_eq!(
        actions(&bridge.from),
        vec![
            Action::ReceiveFeesLockConfirmation,
            Action::ConfirmFeesLockedAndDepositConfirmed
        ]
    );

    let state = bridge.store.get_operation_state(&op).await.unwrap();
    for event_type in EventType::ALL {
        assert!(state.contains_key(&event_type), "{} missing", event_type);
    }
    assert_eq!(bridge.store.operation_events(&op).await.unwrap().len(), 6);
    assert!(bridge.store.dead_letters().await.unwrap().is_empty());

    // A fresh listener rescanning from genesis publishes nothing new
    let mut rescan = bridge.listener(&bridge.to, TO);
    let mut cursor = ChainCursor::new(TO, 0);
    let outcome = rescan.poll_once(&mut cursor).await.unwrap();
    assert_eq!(outcome.published, 0);

    // A late duplicate task is discarded without submitting
    let stale = bridge
        .store
        .operation_events(&op)
        .await
        .unwrap()
        .into_iter()
        .find(|event| event.event_type == EventType::FeesDeposited)
        .unwrap();
    let task = Task::from_event(&stale).unwrap();
    bridge
        .broker
        .publish(QUEUE, &task.encode().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(bridge.drain().await, vec![TaskOutcome::Discarded]);
    assert_eq!(bridge.to.submissions().len(), 2);
}
