//! Operation state machine
//!
//! Pure decision table mapping an observed protocol event to the action the
//! relayer must take, the chain it must be taken on, and the event that must
//! already be recorded for the operation before acting.
//!
//! | origin | event                          | finality | target | action                                 | precondition     |
//! |--------|--------------------------------|----------|--------|----------------------------------------|------------------|
//! | from   | OperationCreated               | yes      | -      | -                                      | -                |
//! | to     | FeesDeposited                  | yes      | to     | sendFeesLockConfirmation               | -                |
//! | to     | FeesDepositConfirmed           | no       | from   | receiveFeesLockConfirmation            | -                |
//! | from   | FeesLockedConfirmed            | no       | from   | confirmFeesLockedAndDepositConfirmed   | OperationCreated |
//! | from   | FeesLockedAndDepositConfirmed  | no       | to     | completeOperation                      | -                |
//! | to     | OperationFinalized             | no       | -      | - (terminal)                           | -                |

use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainRole, EventType};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Contract calls the relayer submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    SendFeesLockConfirmation,
    ReceiveFeesLockConfirmation,
    ConfirmFeesLockedAndDepositConfirmed,
    CompleteOperation,
}

impl Action {
    /// Contract function name
    pub fn function_name(&self) -> &'static str {
        match self {
            Action::SendFeesLockConfirmation => "sendFeesLockConfirmation",
            Action::ReceiveFeesLockConfirmation => "receiveFeesLockConfirmation",
            Action::ConfirmFeesLockedAndDepositConfirmed => "confirmFeesLockedAndDepositConfirmed",
            Action::CompleteOperation => "completeOperation",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

/// What the relayer does in response to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Chain role the action is submitted on
    pub target: Option<ChainRole>,
    pub action: Option<Action>,
    pub precondition: Option<EventType>,
    pub requires_finality: bool,
    pub terminal: bool,
}

/// Role of the chain that emits `event_type`
pub fn expected_origin(event_type: EventType) -> ChainRole {
    match event_type {
        EventType::OperationCreated
        | EventType::FeesLockedConfirmed
        | EventType::FeesLockedAndDepositConfirmed => ChainRole::From,
        EventType::FeesDeposited
        | EventType::FeesDepositConfirmed
        | EventType::OperationFinalized => ChainRole::To,
    }
}

/// Whether an event must reach its chain's confirmation depth before acting
pub fn requires_finality(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::OperationCreated | EventType::FeesDeposited
    )
}

/// Decide the response to `event_type` observed on a chain playing `origin`.
pub fn decide(event_type: EventType, origin: ChainRole) -> RelayerResult<Decision> {
    if expected_origin(event_type) != origin {
        return Err(RelayerError::UnexpectedOrigin {
            event_type,
            role: origin,
        });
    }

    let (target, action, precondition) = match event_type {
        EventType::OperationCreated => (None, None, None),
        EventType::FeesDeposited => (
            Some(ChainRole::To),
            Some(Action::SendFeesLockConfirmation),
            None,
        ),
        EventType::FeesDepositConfirmed => (
            Some(ChainRole::From),
            Some(Action::ReceiveFeesLockConfirmation),
            None,
        ),
        EventType::FeesLockedConfirmed => (
            Some(ChainRole::From),
            Some(Action::ConfirmFeesLockedAndDepositConfirmed),
            Some(EventType::OperationCreated),
        ),
        EventType::FeesLockedAndDepositConfirmed => (
            Some(ChainRole::To),
            Some(Action::CompleteOperation),
            None,
        ),
        EventType::OperationFinalized => (None, None, None),
    };

    Ok(Decision {
        target,
        action,
        precondition,
        requires_finality: requires_finality(event_type),
        terminal: event_type == EventType::OperationFinalized,
    })
}
