//! Chain module - ledger access for every bridged chain
//!
//! This module provides:
//! - The [`LedgerClient`] seam the listener and dispatcher talk to
//! - An ethers-based client with multi-RPC failover
//! - Per-chain event listening with finality gating

pub mod finality;
pub mod listener;
pub mod provider;

#[cfg(test)]
pub(crate) mod fake;

pub use finality::FinalityGate;
pub use listener::EventListener;
pub use provider::EvmLedgerClient;

use crate::config::Settings;
use crate::coordination::Action;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, EventPayload, RawEvent};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256};
use std::sync::Arc;
use tracing::info;

/// Outcome of a mined submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
}

/// Where a broadcast transaction stands on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not mined yet
    Pending,
    Confirmed(TxReceipt),
    Reverted,
    /// Neither mined nor in the mempool; it was dropped
    Unknown,
}

/// Read and write access to one chain's bridge contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn latest_block(&self) -> RelayerResult<u64>;

    /// Logs emitted by `contract` in `[from_block, to_block]` whose topic0 is
    /// one of `topics`
    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        contract: Address,
        topics: &[H256],
    ) -> RelayerResult<Vec<RawEvent>>;

    /// Sign and broadcast `action` for the operation described by
    /// `payload`. An error means the node did not accept the transaction.
    ///
    /// Reverts found while estimating gas come back as
    /// [`RelayerError::SubmissionReverted`]; network, gas and nonce failures
    /// as [`RelayerError::TransientNetwork`].
    async fn send(&self, action: Action, payload: &EventPayload) -> RelayerResult<H256>;

    /// Wait for a broadcast transaction to be mined. Times out with
    /// [`RelayerError::TransientNetwork`]; a mined revert is
    /// [`RelayerError::SubmissionReverted`].
    async fn wait_for_receipt(&self, tx_hash: H256) -> RelayerResult<TxReceipt>;

    async fn transaction_status(&self, tx_hash: H256) -> RelayerResult<TxStatus>;

    async fn health_check(&self) -> bool;
}

/// Ledger clients for every chain the dispatcher may submit to
#[derive(Default)]
pub struct ChainRegistry {
    clients: DashMap<ChainId, Arc<dyn LedgerClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to every enabled chain
    pub async fn connect(settings: &Settings, wallet: &LocalWallet) -> RelayerResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );
            let client = EvmLedgerClient::new(chain_config.clone(), wallet.clone()).await?;
            registry.insert(Arc::new(client));
        }

        Ok(registry)
    }

    pub fn insert(&self, client: Arc<dyn LedgerClient>) {
        self.clients.insert(client.chain_id(), client);
    }

    pub fn get(&self, chain_id: ChainId) -> RelayerResult<Arc<dyn LedgerClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.clients.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        let clients: Vec<_> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::with_capacity(clients.len());

        for client in clients {
            let healthy = client.health_check().await;
            crate::metrics::record_chain_health(client.chain_id(), healthy);
            results.push((client.chain_id(), healthy));
        }

        results.sort_unstable();
        results
    }
}
