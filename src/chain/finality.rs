//! Confirmation-depth gating for events that must be final before acting
//!
//! Chains finalize at different depths (Ethereum practical finality is ~32
//! blocks, Polygon 128, chains with instant finality 1). Events whose type
//! requires finality wait here until `current - block >= depth`.

use crate::events::{ChainId, Event, EventKey};

use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Events observed on one chain that have not reached confirmation depth
pub struct FinalityGate {
    chain_id: ChainId,
    confirmation_depth: u64,
    /// Ordered by (block, tx, log) so releases come out in chain order
    pending: BTreeMap<(u64, EventKey), Event>,
}

impl FinalityGate {
    pub fn new(chain_id: ChainId, confirmation_depth: u64) -> Self {
        let recommended = recommended_confirmations(chain_id);
        if confirmation_depth < recommended {
            warn!(
                "Chain {}: confirmation depth {} is below the recommended {}",
                chain_id, confirmation_depth, recommended
            );
        }
        Self {
            chain_id,
            confirmation_depth,
            pending: BTreeMap::new(),
        }
    }

    pub fn is_final(&self, block_number: u64, current_block: u64) -> bool {
        current_block.saturating_sub(block_number) >= self.confirmation_depth
            && current_block >= block_number
    }

    /// Hold an event until it is final. Returns `false` if already held.
    pub fn hold(&mut self, event: Event) -> bool {
        let slot = (event.block_number, event.key());
        if self.pending.contains_key(&slot) {
            return false;
        }
        debug!(
            "Chain {}: holding {} at block {} for {} confirmations",
            self.chain_id, event.event_type, event.block_number, self.confirmation_depth
        );
        self.pending.insert(slot, event);
        true
    }

    /// Remove and return every held event that is now final, in chain order
    pub fn release(&mut self, current_block: u64) -> Vec<Event> {
        let ready: Vec<_> = self
            .pending
            .keys()
            .take_while(|(block, _)| self.is_final(*block, current_block))
            .cloned()
            .collect();

        ready
            .into_iter()
            .filter_map(|slot| self.pending.remove(&slot))
            .collect()
    }

    /// Put back events whose release could not be completed
    pub fn restore(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.pending.insert((event.block_number, event.key()), event);
        }
    }

    pub fn lowest_pending_block(&self) -> Option<u64> {
        self.pending.keys().next().map(|(block, _)| *block)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: ChainId) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // BNB Smart Chain
        56 | 97 => 15,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local development chains
        1337 | 31337 => 0,
        _ => 1,
    }
}
