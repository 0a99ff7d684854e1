//! Bridge contract events and the data they carry
//!
//! Defines the six protocol event types emitted by the bridge contracts on the
//! `from` and `to` chains, the operation identity they refer to, and the
//! observed/raw event records that flow from the listener into the store.

pub mod decoder;

pub use decoder::EventDecoder;

use crate::error::RelayerError;

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

pub type ChainId = u64;

/// Which side of an operation a chain plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    From,
    To,
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRole::From => write!(f, "from"),
            ChainRole::To => write!(f, "to"),
        }
    }
}

/// Events emitted by the bridge contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    OperationCreated,
    FeesDeposited,
    FeesDepositConfirmed,
    FeesLockedConfirmed,
    FeesLockedAndDepositConfirmed,
    OperationFinalized,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::OperationCreated,
        EventType::FeesDeposited,
        EventType::FeesDepositConfirmed,
        EventType::FeesLockedConfirmed,
        EventType::FeesLockedAndDepositConfirmed,
        EventType::OperationFinalized,
    ];

    /// Contract event name
    pub fn name(&self) -> &'static str {
        match self {
            EventType::OperationCreated => "OperationCreated",
            EventType::FeesDeposited => "FeesDeposited",
            EventType::FeesDepositConfirmed => "FeesDepositConfirmed",
            EventType::FeesLockedConfirmed => "FeesLockedConfirmed",
            EventType::FeesLockedAndDepositConfirmed => "FeesLockedAndDepositConfirmed",
            EventType::OperationFinalized => "OperationFinalized",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventType {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| RelayerError::UnknownEvent(s.to_string()))
    }
}

/// Identity of one end-to-end transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub H256);

impl OperationId {
    /// Derive an operation id from its origin coordinates.
    ///
    /// Used when an origin-chain log does not carry the contract's
    /// `operationHash`.
    pub fn derive(origin_chain_id: ChainId, origin_tx: H256, nonce: u64) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(origin_chain_id.to_be_bytes());
        hasher.update(origin_tx.as_bytes());
        hasher.update(nonce.to_be_bytes());
        OperationId(H256::from_slice(&hasher.finalize()))
    }
}

impl From<[u8; 32]> for OperationId {
    fn from(bytes: [u8; 32]) -> Self {
        OperationId(H256::from(bytes))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl FromStr for OperationId {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| RelayerError::Decode(format!("invalid operation id {}: {}", s, e)))?;
        if bytes.len() != 32 {
            return Err(RelayerError::Decode(format!(
                "invalid operation id {}: expected 32 bytes, got {}",
                s,
                bytes.len()
            )));
        }
        Ok(OperationId(H256::from_slice(&bytes)))
    }
}

/// The bridge contract's `OperationParams` tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationParams {
    pub from: Address,
    pub to: Address,
    pub chain_id_from: ChainId,
    pub chain_id_to: ChainId,
    pub token_name: String,
    pub amount: U256,
    pub nonce: u64,
    pub signature: Bytes,
}

impl OperationParams {
    /// ABI tuple in contract field order
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.from),
            Token::Address(self.to),
            Token::Uint(U256::from(self.chain_id_from)),
            Token::Uint(U256::from(self.chain_id_to)),
            Token::String(self.token_name.clone()),
            Token::Uint(self.amount),
            Token::Uint(U256::from(self.nonce)),
            Token::Bytes(self.signature.to_vec()),
        ])
    }
}

/// Decoded arguments shared by every protocol event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub operation_hash: OperationId,
    pub params: OperationParams,
    pub block_step: u64,
}

impl EventPayload {
    /// Role the given chain plays in this operation
    pub fn role_of(&self, chain_id: ChainId) -> Option<ChainRole> {
        if chain_id == self.params.chain_id_from {
            Some(ChainRole::From)
        } else if chain_id == self.params.chain_id_to {
            Some(ChainRole::To)
        } else {
            None
        }
    }

    /// Chain id playing the given role
    pub fn chain_for(&self, role: ChainRole) -> ChainId {
        match role {
            ChainRole::From => self.params.chain_id_from,
            ChainRole::To => self.params.chain_id_to,
        }
    }
}

/// Globally unique identity of an observed log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: ChainId,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl EventKey {
    pub fn new(chain_id: ChainId, tx_hash: H256, log_index: u64) -> Self {
        Self {
            chain_id,
            tx_hash,
            log_index,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/0x{}/{}",
            self.chain_id,
            hex::encode(self.tx_hash.as_bytes()),
            self.log_index
        )
    }
}

/// An undecoded contract log as returned by a ledger client
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl RawEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.chain_id, self.tx_hash, self.log_index)
    }
}

/// A decoded, observed protocol event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub observed_at: DateTime<Utc>,
}

impl Event {
    pub fn from_raw(raw: &RawEvent, event_type: EventType, payload: EventPayload) -> Self {
        Self {
            chain_id: raw.chain_id,
            block_number: raw.block_number,
            tx_hash: raw.tx_hash,
            log_index: raw.log_index,
            event_type,
            payload,
            observed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.chain_id, self.tx_hash, self.log_index)
    }

    pub fn operation_id(&self) -> OperationId {
        self.payload.operation_hash
    }

    /// Role of the chain this event was observed on
    pub fn origin_role(&self) -> Option<ChainRole> {
        self.payload.role_of(self.chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.name().parse::<EventType>().unwrap(), event_type);
        }
    }

    #[test]
    fn test_unknown_event_name_is_rejected() {
        let err = "OwnershipTransferred".parse::<EventType>().unwrap_err();
        assert!(matches!(err, RelayerError::UnknownEvent(name) if name == "OwnershipTransferred"));
    }

    #[test]
    fn test_operation_id_derivation_is_deterministic() {
        let tx = H256::repeat_byte(0xab);
        let a = OperationId::derive(1337, tx, 20);
        let b = OperationId::derive(1337, tx, 20);
        assert_eq!(a, b);
        assert_ne!(a, OperationId::derive(1337, tx, 21));
        assert_ne!(a, OperationId::derive(440, tx, 20));
    }

    #[test]
    fn test_operation_id_display_parses_back() {
        let id = OperationId::from([0x11; 32]);
        let shown = id.to_string();
        assert!(shown.starts_with("0x1111"));
        assert_eq!(shown.parse::<OperationId>().unwrap(), id);
        assert!("0x1234".parse::<OperationId>().is_err());
    }

    #[test]
    fn test_role_of_chain() {
        let payload = EventPayload {
            operation_hash: OperationId::from([1; 32]),
            params: OperationParams {
                from: Address::zero(),
                to: Address::zero(),
                chain_id_from: 1337,
                chain_id_to: 440,
                token_name: "ethereum".into(),
                amount: U256::from(1_000u64),
                nonce: 1,
                signature: Bytes::default(),
            },
            block_step: 10,
        };
        assert_eq!(payload.role_of(1337), Some(ChainRole::From));
        assert_eq!(payload.role_of(440), Some(ChainRole::To));
        assert_eq!(payload.role_of(1), None);
        assert_eq!(payload.chain_for(ChainRole::To), 440);
    }
}
