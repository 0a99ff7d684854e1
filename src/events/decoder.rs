//! ABI-driven decoding of raw bridge contract logs

use super::{ChainId, EventPayload, EventType, OperationId, OperationParams, RawEvent};
use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{Abi, Event as AbiEvent, LogParam, RawLog, Token};
use ethers::types::{Bytes, H256, U256};
use std::collections::HashMap;

/// Decodes logs emitted by one chain's bridge contract
pub struct EventDecoder {
    chain_id: ChainId,
    events: HashMap<H256, AbiEvent>,
}

impl EventDecoder {
    /// Index every event in the contract ABI by its topic signature
    pub fn new(chain_id: ChainId, abi: &Abi) -> Self {
        let events = abi
            .events()
            .map(|event| (event.signature(), event.clone()))
            .collect();
        Self { chain_id, events }
    }

    /// Topic0 filter covering every event the ABI declares
    pub fn topics(&self) -> Vec<H256> {
        let mut topics: Vec<H256> = self.events.keys().copied().collect();
        topics.sort();
        topics
    }

    /// Decode a raw log into a protocol event type and payload.
    ///
    /// Returns [`RelayerError::UnknownEvent`] when the ABI declares the event
    /// but the protocol does not, and [`RelayerError::Decode`] for logs that
    /// do not match their declared shape.
    pub fn decode(&self, raw: &RawEvent) -> RelayerResult<(EventType, EventPayload)> {
        let topic = raw
            .topics
            .first()
            .ok_or_else(|| RelayerError::Decode(format!("log {} has no topics", raw.key())))?;

        let abi_event = self.events.get(topic).ok_or_else(|| {
            RelayerError::Decode(format!("log {} has unrecognized topic {:?}", raw.key(), topic))
        })?;

        let event_type: EventType = abi_event.name.parse()?;

        let log = abi_event
            .parse_log(RawLog {
                topics: raw.topics.clone(),
                data: raw.data.to_vec(),
            })
            .map_err(|e| RelayerError::Decode(format!("{} at {}: {}", event_type, raw.key(), e)))?;

        let params = find_param(&log.params, "params")
            .ok_or_else(|| missing(event_type, "params"))
            .and_then(|token| decode_params(token.clone()))?;

        let block_step = match find_param(&log.params, "blockStep") {
            Some(Token::Uint(value)) => to_u64(*value, "blockStep")?,
            Some(_) => return Err(mismatch(event_type, "blockStep")),
            None => raw.block_number,
        };

        let operation_hash = match find_param(&log.params, "operationHash") {
            Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
                OperationId(H256::from_slice(bytes))
            }
            Some(_) => return Err(mismatch(event_type, "operationHash")),
            None if self.chain_id == params.chain_id_from => {
                OperationId::derive(self.chain_id, raw.tx_hash, params.nonce)
            }
            None => return Err(missing(event_type, "operationHash")),
        };

        Ok((
            event_type,
            EventPayload {
                operation_hash,
                params,
                block_step,
            },
        ))
    }
}

/// Parameter names differ between contract versions only by a leading `_`
fn find_param<'a>(params: &'a [LogParam], name: &str) -> Option<&'a Token> {
    params
        .iter()
        .find(|p| p.name.trim_start_matches('_') == name)
        .map(|p| &p.value)
}

fn decode_params(token: Token) -> RelayerResult<OperationParams> {
    let fields = match token {
        Token::Tuple(fields) if fields.len() == 8 => fields,
        other => {
            return Err(RelayerError::Decode(format!(
                "params is not an 8-field tuple: {:?}",
                other
            )))
        }
    };

    let mut fields = fields.into_iter();
    let mut next = |name: &str| {
        fields
            .next()
            .ok_or_else(|| RelayerError::Decode(format!("params.{} missing", name)))
    };

    let from = next("from")?
        .into_address()
        .ok_or_else(|| RelayerError::Decode("params.from is not an address".into()))?;
    let to = next("to")?
        .into_address()
        .ok_or_else(|| RelayerError::Decode("params.to is not an address".into()))?;
    let chain_id_from = uint_field(next("chainIdFrom")?, "chainIdFrom")?;
    let chain_id_to = uint_field(next("chainIdTo")?, "chainIdTo")?;
    let token_name = next("tokenName")?
        .into_string()
        .ok_or_else(|| RelayerError::Decode("params.tokenName is not a string".into()))?;
    let amount = next("amount")?
        .into_uint()
        .ok_or_else(|| RelayerError::Decode("params.amount is not a uint".into()))?;
    let nonce = uint_field(next("nonce")?, "nonce")?;
    let signature = next("signature")?
        .into_bytes()
        .map(Bytes::from)
        .ok_or_else(|| RelayerError::Decode("params.signature is not bytes".into()))?;

    Ok(OperationParams {
        from,
        to,
        chain_id_from,
        chain_id_to,
        token_name,
        amount,
        nonce,
        signature,
    })
}

fn uint_field(token: Token, name: &str) -> RelayerResult<u64> {
    let value = token
        .into_uint()
        .ok_or_else(|| RelayerError::Decode(format!("params.{} is not a uint", name)))?;
    to_u64(value, name)
}

fn to_u64(value: U256, name: &str) -> RelayerResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(RelayerError::Decode(format!("{} overflows u64", name)));
    }
    Ok(value.as_u64())
}

fn missing(event_type: EventType, field: &str) -> RelayerError {
    RelayerError::Decode(format!("{} is missing {}", event_type, field))
}

fn mismatch(event_type: EventType, field: &str) -> RelayerError {
    RelayerError::Decode(format!("{} has a malformed {}", event_type, field))
}
