//! Tasks handed from the listeners to the dispatcher

use super::machine;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, ChainRole, Event, EventKey, EventPayload, EventType, OperationId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of dispatcher work, produced from a finalized event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub operation_id: OperationId,
    pub event_type: EventType,
    pub origin_chain_id: ChainId,
    /// Chain the action is submitted on; `None` for events with no action
    pub target_chain_id: Option<ChainId>,
    pub payload: EventPayload,
    pub attempt_count: u32,
    pub event_key: EventKey,
}

impl Task {
    /// Build the task for a finalized event.
    ///
    /// Fails if the event was observed on a chain that plays no role in its
    /// operation, or a role the protocol does not emit it from.
    pub fn from_event(event: &Event) -> RelayerResult<Self> {
        let origin = event.origin_role().ok_or_else(|| {
            RelayerError::Decode(format!(
                "event {} on chain {} names neither side of operation {}",
                event.event_type,
                event.chain_id,
                event.operation_id()
            ))
        })?;
        let decision = machine::decide(event.event_type, origin)?;

        Ok(Self {
            operation_id: event.operation_id(),
            event_type: event.event_type,
            origin_chain_id: event.chain_id,
            target_chain_id: decision.target.map(|role| event.payload.chain_for(role)),
            payload: event.payload.clone(),
            attempt_count: 0,
            event_key: event.key(),
        })
    }

    pub fn origin_role(&self) -> Option<ChainRole> {
        self.payload.role_of(self.origin_chain_id)
    }

    /// Copy of this task for its next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> RelayerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> RelayerResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A task parked for operator intervention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: Task, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}
