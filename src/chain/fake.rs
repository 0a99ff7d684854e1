//! Scriptable in-memory ledger for listener, dispatcher and scenario tests

use super::{LedgerClient, TxReceipt, TxStatus};
use crate::coordination::Action;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, EventPayload, RawEvent};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SubmitHook = Arc<dyn Fn(Action, &EventPayload) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    latest_block: u64,
    logs: Vec<RawEvent>,
    submissions: Vec<(Action, EventPayload)>,
    send_failures: VecDeque<RelayerError>,
    receipt_failures: VecDeque<RelayerError>,
    statuses: HashMap<H256, TxStatus>,
    get_logs_failures: u32,
    get_logs_calls: Vec<(u64, u64)>,
    next_tx: u64,
}

pub(crate) struct FakeLedger {
    chain_id: ChainId,
    state: Mutex<FakeState>,
    submit_delay: Option<Duration>,
    on_submit: Mutex<Option<SubmitHook>>,
}

impl FakeLedger {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeState::default()),
            submit_delay: None,
            on_submit: Mutex::new(None),
        }
    }

    /// Make every submission take `delay`, so concurrent callers overlap
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn set_latest_block(&self, block: u64) {
        self.state.lock().unwrap().latest_block = block;
    }

    pub fn push_log(&self, raw: RawEvent) {
        let mut state = self.state.lock().unwrap();
        state.latest_block = state.latest_block.max(raw.block_number);
        state.logs.push(raw);
    }

    /// Fail the next broadcasts; the attempts still count as submissions
    pub fn fail_next_submits(&self, errors: impl IntoIterator<Item = RelayerError>) {
        self.state.lock().unwrap().send_failures.extend(errors);
    }

    /// Fail the next receipt waits after a successful broadcast
    pub fn fail_next_receipts(&self, errors: impl IntoIterator<Item = RelayerError>) {
        self.state.lock().unwrap().receipt_failures.extend(errors);
    }

    /// Override what `transaction_status` reports for `tx_hash`
    pub fn set_tx_status(&self, tx_hash: H256, status: TxStatus) {
        self.state.lock().unwrap().statuses.insert(tx_hash, status);
    }

    pub fn fail_next_get_logs(&self, times: u32) {
        self.state.lock().unwrap().get_logs_failures = times;
    }

    pub fn on_submit(&self, hook: impl Fn(Action, &EventPayload) + Send + Sync + 'static) {
        *self.on_submit.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn submissions(&self) -> Vec<(Action, EventPayload)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().get_logs_calls.clone()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn latest_block(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().latest_block)
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        _contract: Address,
        topics: &[H256],
    ) -> RelayerResult<Vec<RawEvent>> {
        let mut state = self.state.lock().unwrap();
        state.get_logs_calls.push((from_block, to_block));
        if state.get_logs_failures > 0 {
            state.get_logs_failures -= 1;
            return Err(RelayerError::TransientNetwork {
                chain_id: self.chain_id,
                message: "connection reset".into(),
            });
        }

        let mut logs: Vec<RawEvent> = state
            .logs
            .iter()
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .filter(|log| log.topics.first().map_or(false, |t| topics.contains(t)))
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn send(&self, action: Action, payload: &EventPayload) -> RelayerResult<H256> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }

        let tx_hash = {
            let mut state = self.state.lock().unwrap();
            state.submissions.push((action, payload.clone()));
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
            state.next_tx += 1;
            let tx_hash = H256::from_low_u64_be(self.chain_id << 32 | state.next_tx);
            let receipt = TxReceipt {
                tx_hash,
                block_number: Some(state.latest_block),
            };
            state.statuses.insert(tx_hash, TxStatus::Confirmed(receipt));
            tx_hash
        };

        let hook = self.on_submit.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(action, payload);
        }
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> RelayerResult<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.receipt_failures.pop_front() {
            return Err(err);
        }
        match state.statuses.get(&tx_hash) {
            Some(TxStatus::Confirmed(receipt)) => Ok(receipt.clone()),
            Some(TxStatus::Reverted) => Err(RelayerError::SubmissionReverted {
                chain_id: self.chain_id,
                message: format!("transaction {:?} reverted", tx_hash),
            }),
            _ => Err(RelayerError::TransientNetwork {
                chain_id: self.chain_id,
                message: format!("no receipt for {:?}", tx_hash),
            }),
        }
    }

    async fn transaction_status(&self, tx_hash: H256) -> RelayerResult<TxStatus> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(&tx_hash)
            .cloned()
            .unwrap_or(TxStatus::Unknown))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
