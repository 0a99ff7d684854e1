//! Event store: observed events, per-operation state, execution markers,
//! leases, chain cursors and dead letters over a [`KvStore`].
//!
//! Key layout:
//! - `event/{chain}/{tx}/{log}`             observed event (append-only)
//! - `published/{chain}/{tx}/{log}`         task for the event was published
//! - `op/{id}/events/{chain}/{tx}/{log}`    per-operation event index
//! - `op/{id}/state`                        operation state (one record)
//! - `op/{id}/executed/{event_type}`        action executed marker
//! - `op/{id}/intent/{event_type}`          submission in progress
//! - `op/{id}/archived`                     terminal event recorded
//! - `lock/{id}`                            per-operation lease
//! - `cursor/{chain}`                       listener cursor
//! - `deadletter/{id}/{event_type}`         dead-lettered task
//!
//! Every state transition is a compare-and-swap so concurrent dispatcher
//! workers converge on a single winner.

use super::KvStore;
use crate::coordination::{Action, DeadLetter};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, Event, EventKey, EventType, OperationId};

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Event types recorded for an operation, with the time they were recorded
pub type OperationState = BTreeMap<EventType, DateTime<Utc>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored,
    Duplicate,
}

/// Marker that the action for `(operation_id, event_type)` was submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub operation_id: OperationId,
    pub event_type: EventType,
    pub action: Action,
    pub target_chain_id: ChainId,
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub executed_at: DateTime<Utc>,
}

/// Written before submitting, removed once the outcome is recorded.
///
/// `tx_hash` is filled in as soon as the node accepts the transaction, so a
/// later attempt can look it up instead of submitting again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionIntent {
    pub operation_id: OperationId,
    pub event_type: EventType,
    pub holder: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub tx_hash: Option<H256>,
}

/// Time-limited exclusive claim on one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub operation_id: OperationId,
    pub holder: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Acquired(Lease),
    Busy {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

/// Last block a listener fully processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub chain_id: ChainId,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl ChainCursor {
    pub fn new(chain_id: ChainId, last_processed_block: u64) -> Self {
        Self {
            chain_id,
            last_processed_block,
            updated_at: Utc::now(),
        }
    }
}

/// Durable record of observed events and per-operation progress
pub struct EventStore {
    kv: Arc<dyn KvStore>,
}

impl EventStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn health_check(&self) -> RelayerResult<()> {
        self.kv.health_check().await
    }

    // ---------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------

    /// Append an observed event; re-appending the same identity is a no-op.
    pub async fn append(&self, event: &Event) -> RelayerResult<AppendOutcome> {
        let key = event.key();
        let stored = self
            .kv
            .compare_and_swap(&event_key(&key), None, Some(encode(event)?))
            .await?;

        // Index is idempotent; re-appending heals a crash between the writes
        self.kv
            .put(&op_event_index_key(&event.operation_id(), &key), Vec::new())
            .await?;

        if stored {
            debug!("Stored event {} ({})", key, event.event_type);
            Ok(AppendOutcome::Stored)
        } else {
            Ok(AppendOutcome::Duplicate)
        }
    }

    pub async fn exists(&self, key: &EventKey) -> RelayerResult<bool> {
        Ok(self.kv.get(&event_key(key)).await?.is_some())
    }

    /// Events observed for an operation, in key order
    pub async fn operation_events(&self, operation_id: &OperationId) -> RelayerResult<Vec<Event>> {
        let prefix = format!("op/{}/events/", operation_id);
        let mut events = Vec::new();
        for (key, _) in self.kv.scan_prefix(&prefix).await? {
            let event_key = format!("event/{}", &key[prefix.len()..]);
            if let Some(event) = self.get_decoded(&event_key).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    pub async fn mark_published(&self, key: &EventKey) -> RelayerResult<()> {
        self.kv
            .put(&published_key(key), encode(&Utc::now())?)
            .await
    }

    pub async fn is_published(&self, key: &EventKey) -> RelayerResult<bool> {
        Ok(self.kv.get(&published_key(key)).await?.is_some())
    }

    // ---------------------------------------------------------------
    // Operation state
    // ---------------------------------------------------------------

    pub async fn get_operation_state(
        &self,
        operation_id: &OperationId,
    ) -> RelayerResult<OperationState> {
        match self.kv.get(&state_key(operation_id)).await? {
            Some(bytes) => decode(&bytes),
            None => Ok(OperationState::new()),
        }
    }

    /// Record that `event_type` has been handled for an operation.
    ///
    /// Returns `false` if it was already recorded. Fails with
    /// [`RelayerError::OperationArchived`] once the terminal event is in.
    /// The whole state is one record replaced by compare-and-swap, so the
    /// terminal check and the write cannot interleave with another writer.
    pub async fn record_for_operation(
        &self,
        operation_id: &OperationId,
        event_type: EventType,
        recorded_at: DateTime<Utc>,
    ) -> RelayerResult<bool> {
        let key = state_key(operation_id);
        loop {
            let current = self.kv.get(&key).await?;
            let mut state: OperationState = match &current {
                Some(bytes) => decode(bytes)?,
                None => OperationState::new(),
            };

            if state.contains_key(&event_type) {
                return Ok(false);
            }
            if state.contains_key(&EventType::OperationFinalized)
                || self.is_archived(operation_id).await?
            {
                return Err(RelayerError::OperationArchived(*operation_id));
            }

            state.insert(event_type, recorded_at);
            if self
                .kv
                .compare_and_swap(&key, current.as_deref(), Some(encode(&state)?))
                .await?
            {
                return Ok(true);
            }
            debug!(
                "State of operation {} changed while recording {}, retrying",
                operation_id, event_type
            );
        }
    }

    /// Freeze the operation; no further state may be recorded.
    pub async fn archive(&self, operation_id: &OperationId) -> RelayerResult<bool> {
        let archived = self
            .kv
            .compare_and_swap(&archived_key(operation_id), None, Some(encode(&Utc::now())?))
            .await?;
        if archived {
            info!("Operation {} archived", operation_id);
        }
        Ok(archived)
    }

    pub async fn is_archived(&self, operation_id: &OperationId) -> RelayerResult<bool> {
        Ok(self.kv.get(&archived_key(operation_id)).await?.is_some())
    }

    // ---------------------------------------------------------------
    // Execution markers
    // ---------------------------------------------------------------

    pub async fn execution(
        &self,
        operation_id: &OperationId,
        event_type: EventType,
    ) -> RelayerResult<Option<ExecutionRecord>> {
        self.get_decoded(&executed_key(operation_id, event_type))
            .await
    }

    /// Returns `false` if another worker already recorded the execution
    pub async fn record_execution(&self, record: &ExecutionRecord) -> RelayerResult<bool> {
        self.kv
            .compare_and_swap(
                &executed_key(&record.operation_id, record.event_type),
                None,
                Some(encode(record)?),
            )
            .await
    }

    pub async fn begin_submission(&self, intent: &SubmissionIntent) -> RelayerResult<bool> {
        self.kv
            .compare_and_swap(
                &intent_key(&intent.operation_id, intent.event_type),
                None,
                Some(encode(intent)?),
            )
            .await
    }

    /// Store the intent again with its broadcast transaction attached
    pub async fn record_broadcast(&self, intent: &SubmissionIntent) -> RelayerResult<()> {
        self.kv
            .put(
                &intent_key(&intent.operation_id, intent.event_type),
                encode(intent)?,
            )
            .await
    }

    pub async fn submission_intent(
        &self,
        operation_id: &OperationId,
        event_type: EventType,
    ) -> RelayerResult<Option<SubmissionIntent>> {
        self.get_decoded(&intent_key(operation_id, event_type)).await
    }

    pub async fn clear_submission(
        &self,
        operation_id: &OperationId,
        event_type: EventType,
    ) -> RelayerResult<()> {
        self.kv.delete(&intent_key(operation_id, event_type)).await
    }

    // ---------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------

    /// Try to take the operation's lease. Expired leases are taken over.
    pub async fn acquire_lock(
        &self,
        operation_id: &OperationId,
        holder: &str,
        ttl: Duration,
    ) -> RelayerResult<LockOutcome> {
        let key = lock_key(operation_id);
        let current = self.kv.get(&key).await?;

        if let Some(bytes) = &current {
            let existing: Lease = decode(bytes)?;
            if !existing.is_expired() {
                return Ok(LockOutcome::Busy {
                    holder: existing.holder,
                    expires_at: existing.expires_at,
                });
            }
            debug!(
                "Taking over expired lease on {} from {}",
                operation_id, existing.holder
            );
        }

        let lease = Lease {
            operation_id: *operation_id,
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            expires_at: expiry(ttl)?,
        };

        if self
            .kv
            .compare_and_swap(&key, current.as_deref(), Some(encode(&lease)?))
            .await?
        {
            return Ok(LockOutcome::Acquired(lease));
        }

        // Lost the race; report whoever holds it now
        match self.get_decoded::<Lease>(&key).await? {
            Some(winner) => Ok(LockOutcome::Busy {
                holder: winner.holder,
                expires_at: winner.expires_at,
            }),
            None => Ok(LockOutcome::Busy {
                holder: String::new(),
                expires_at: Utc::now(),
            }),
        }
    }

    /// Extend a held lease. Returns `None` if the lease was lost.
    pub async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> RelayerResult<Option<Lease>> {
        let renewed = Lease {
            expires_at: expiry(ttl)?,
            ..lease.clone()
        };
        let swapped = self
            .kv
            .compare_and_swap(
                &lock_key(&lease.operation_id),
                Some(&encode(lease)?),
                Some(encode(&renewed)?),
            )
            .await?;
        Ok(swapped.then_some(renewed))
    }

    /// Release a held lease. Returns `false` if it had already been taken over.
    pub async fn release_lock(&self, lease: &Lease) -> RelayerResult<bool> {
        self.kv
            .compare_and_swap(&lock_key(&lease.operation_id), Some(&encode(lease)?), None)
            .await
    }

    // ---------------------------------------------------------------
    // Cursors
    // ---------------------------------------------------------------

    pub async fn load_cursor(&self, chain_id: ChainId) -> RelayerResult<Option<ChainCursor>> {
        self.get_decoded(&cursor_key(chain_id)).await
    }

    pub async fn save_cursor(&self, cursor: &ChainCursor) -> RelayerResult<()> {
        self.kv.put(&cursor_key(cursor.chain_id), encode(cursor)?).await?;
        debug!(
            "Saved cursor for chain {}: block {}",
            cursor.chain_id, cursor.last_processed_block
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Dead letters
    // ---------------------------------------------------------------

    /// Park a task for operator intervention. Returns `false` if it was
    /// already dead-lettered.
    pub async fn dead_letter(&self, entry: &DeadLetter) -> RelayerResult<bool> {
        self.kv
            .compare_and_swap(
                &dead_letter_key(&entry.task.operation_id, entry.task.event_type),
                None,
                Some(encode(entry)?),
            )
            .await
    }

    pub async fn is_dead_lettered(
        &self,
        operation_id: &OperationId,
        event_type: EventType,
    ) -> RelayerResult<bool> {
        Ok(self
            .kv
            .get(&dead_letter_key(operation_id, event_type))
            .await?
            .is_some())
    }

    pub async fn dead_letters(&self) -> RelayerResult<Vec<DeadLetter>> {
        self.kv
            .scan_prefix("deadletter/")
            .await?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    async fn get_decoded<T: DeserializeOwned>(&self, key: &str) -> RelayerResult<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> RelayerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Undecodable stored records mean the store is in an unknown state
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RelayerResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| RelayerError::Storage(format!("corrupt record: {}", e)))
}

fn expiry(ttl: Duration) -> RelayerResult<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| RelayerError::Config(format!("invalid lock ttl: {}", e)))?;
    Ok(Utc::now() + ttl)
}

fn event_key(key: &EventKey) -> String {
    format!("event/{}", key)
}

fn published_key(key: &EventKey) -> String {
    format!("published/{}", key)
}

fn op_event_index_key(operation_id: &OperationId, key: &EventKey) -> String {
    format!("op/{}/events/{}", operation_id, key)
}

fn state_key(operation_id: &OperationId) -> String {
    format!("op/{}/state", operation_id)
}

fn executed_key(operation_id: &OperationId, event_type: EventType) -> String {
    format!("op/{}/executed/{}", operation_id, event_type)
}

fn intent_key(operation_id: &OperationId, event_type: EventType) -> String {
    format!("op/{}/intent/{}", operation_id, event_type)
}

fn archived_key(operation_id: &OperationId) -> String {
    format!("op/{}/archived", operation_id)
}

fn lock_key(operation_id: &OperationId) -> String {
    format!("lock/{}", operation_id)
}

fn cursor_key(chain_id: ChainId) -> String {
    format!("cursor/{}", chain_id)
}

fn dead_letter_key(operation_id: &OperationId, event_type: EventType) -> String {
    format!("deadletter/{}/{}", operation_id, event_type)
}
