//! Ethereum ledger client with multi-RPC failover and signed submissions

use super::{LedgerClient, TxReceipt, TxStatus};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::coordination::Action;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, EventPayload, RawEvent};

use async_trait::async_trait;
use ethers::abi::{Abi, Function, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Gas limit headroom over the node's estimate, in percent
const GAS_LIMIT_BUFFER_PERCENT: u64 = 20;
/// Priority fee used for EIP-1559 submissions
const PRIORITY_FEE_WEI: u64 = 2_000_000_000;
const GWEI: u64 = 1_000_000_000;

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// [`LedgerClient`] over JSON-RPC with a local signing key
pub struct EvmLedgerClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Bridge contract
    contract: Address,
    abi: Abi,
    wallet: LocalWallet,
    /// Next nonce to use; `None` until synced from the chain
    nonce: Mutex<Option<U256>>,
}

impl EvmLedgerClient {
    /// Create a new ledger client
    pub async fn new(config: ChainConfig, wallet: LocalWallet) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(500)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Config(format!(
                "Chain {} has no valid RPC providers",
                config.chain_id
            )));
        }

        let contract = config
            .contract_address()
            .map_err(|e| RelayerError::Config(e.to_string()))?;
        let abi = config
            .load_abi()
            .map_err(|e| RelayerError::Config(format!("{:#}", e)))?;
        let wallet = wallet.with_chain_id(config.chain_id);

        info!(
            "Chain {} client ready: contract {:?}, operator {:?}",
            config.chain_id,
            contract,
            wallet.address()
        );

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            contract,
            abi,
            wallet,
            nonce: Mutex::new(None),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn transient(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::TransientNetwork {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// ABI-encode the call for `action`, filling arguments by name
    fn encode_call(&self, action: Action, payload: &EventPayload) -> RelayerResult<Bytes> {
        let function = self.abi.function(action.function_name()).map_err(|e| {
            RelayerError::Config(format!(
                "Chain {} ABI lacks {}: {}",
                self.config.chain_id, action, e
            ))
        })?;

        let tokens = call_arguments(function, payload, self.wallet.address())?;
        function
            .encode_input(&tokens)
            .map(Bytes::from)
            .map_err(|e| RelayerError::Internal(format!("encoding {} failed: {}", action, e)))
    }

    /// Get current gas price based on chain strategy
    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        let cap = U256::from(self.config.max_gas_price_gwei) * U256::from(GWEI);

        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.transient(format!("gas price: {}", e)))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, cap)))
            }
            GasPriceStrategy::Eip1559 => {
                let block = self
                    .http()
                    .get_block(BlockNumber::Latest)
                    .await
                    .map_err(|e| self.transient(format!("latest block: {}", e)))?
                    .ok_or_else(|| self.transient("no latest block"))?;
                let base_fee = block
                    .base_fee_per_gas
                    .ok_or_else(|| self.transient("no base fee in latest block"))?;
                Ok(eip1559_fees(base_fee, cap))
            }
        }
    }

    fn build_tx(
        &self,
        data: Bytes,
        nonce: U256,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(self.wallet.address())
                .to(self.contract)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .chain_id(self.config.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(self.contract)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(self.config.chain_id)
                .into(),
        }
    }

    /// Sign and broadcast under the nonce lock; returns the transaction hash
    async fn broadcast(&self, action: Action, data: Bytes) -> RelayerResult<H256> {
        let mut next_nonce = self.nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self
                .http()
                .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
                .await
                .map_err(|e| self.transient(format!("nonce sync: {}", e)))?,
        };

        let request: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.contract)
            .data(data.clone())
            .into();
        let estimate = self
            .http()
            .estimate_gas(&request, None)
            .await
            .map_err(|e| classify(self.config.chain_id, &e.to_string()))?;
        let gas_limit = estimate + estimate * GAS_LIMIT_BUFFER_PERCENT / 100;
        let gas_price = self.gas_price().await?;

        let tx = self.build_tx(data, nonce, gas_limit, &gas_price);
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Internal(format!("signing failed: {}", e)))?;

        match self.http().send_raw_transaction(tx.rlp_signed(&signature)).await {
            Ok(pending) => {
                *next_nonce = Some(nonce + 1);
                let tx_hash = pending.tx_hash();
                info!(
                    "Chain {}: sent {} as {:?} (nonce {})",
                    self.config.chain_id, action, tx_hash, nonce
                );
                Ok(tx_hash)
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("nonce too low") || message.contains("already known") {
                    // Resync from the chain on the next submission
                    *next_nonce = None;
                }
                Err(classify(self.config.chain_id, &message))
            }
        }
    }

    /// Poll for the receipt until it appears or the configured timeout passes
    async fn poll_receipt(&self, tx_hash: H256) -> RelayerResult<TransactionReceipt> {
        let wait = async {
            loop {
                match self.http().get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok::<_, RelayerError>(receipt),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "Chain {}: receipt lookup for {:?} failed: {}",
                            self.config.chain_id, tx_hash, e
                        );
                        self.failover();
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        };

        tokio::time::timeout(self.config.receipt_timeout(), wait)
            .await
            .map_err(|_| {
                self.transient(format!(
                    "no receipt for {:?} after {:?}",
                    tx_hash,
                    self.config.receipt_timeout()
                ))
            })?
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    /// Get current block number with failover
    async fn latest_block(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.transient("all providers failed to return a block number"))
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        contract: Address,
        topics: &[H256],
    ) -> RelayerResult<Vec<RawEvent>> {
        let filter = Filter::new()
            .address(contract)
            .topic0(ValueOrArray::Array(topics.to_vec()))
            .from_block(from_block)
            .to_block(to_block);

        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(logs) => return logs.into_iter().map(|log| self.raw_event(log)).collect(),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.transient(format!(
            "all providers failed to get logs for blocks {}..={}",
            from_block, to_block
        )))
    }

    async fn send(&self, action: Action, payload: &EventPayload) -> RelayerResult<H256> {
        let data = self.encode_call(action, payload)?;
        self.broadcast(action, data).await
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> RelayerResult<TxReceipt> {
        let receipt = self.poll_receipt(tx_hash).await?;

        if receipt.status == Some(U64::from(1)) {
            Ok(TxReceipt {
                tx_hash,
                block_number: receipt.block_number.map(|b| b.as_u64()),
            })
        } else {
            Err(RelayerError::SubmissionReverted {
                chain_id: self.config.chain_id,
                message: format!("transaction {:?} reverted", tx_hash),
            })
        }
    }

    async fn transaction_status(&self, tx_hash: H256) -> RelayerResult<TxStatus> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        if let Some(receipt) = receipt {
            return Ok(if receipt.status == Some(U64::from(1)) {
                TxStatus::Confirmed(TxReceipt {
                    tx_hash,
                    block_number: receipt.block_number.map(|b| b.as_u64()),
                })
            } else {
                TxStatus::Reverted
            });
        }

        let pending = self
            .http()
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        Ok(if pending.is_some() {
            TxStatus::Pending
        } else {
            TxStatus::Unknown
        })
    }

    async fn health_check(&self) -> bool {
        match self.latest_block().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

impl EvmLedgerClient {
    fn raw_event(&self, log: Log) -> RelayerResult<RawEvent> {
        let (Some(block_number), Some(tx_hash), Some(log_index)) =
            (log.block_number, log.transaction_hash, log.log_index)
        else {
            return Err(self.transient("node returned a pending log"));
        };

        Ok(RawEvent {
            chain_id: self.config.chain_id,
            block_number: block_number.as_u64(),
            tx_hash,
            log_index: log_index.as_u64(),
            topics: log.topics,
            data: log.data,
        })
    }
}

/// Arguments for a bridge call, matched to the function's inputs by name
fn call_arguments(
    function: &Function,
    payload: &EventPayload,
    operator: Address,
) -> RelayerResult<Vec<Token>> {
    function
        .inputs
        .iter()
        .map(|input| match input.name.trim_start_matches('_') {
            "operationHash" => Ok(Token::FixedBytes(payload.operation_hash.0.as_bytes().to_vec())),
            "params" => Ok(payload.params.to_token()),
            "blockStep" => Ok(Token::Uint(U256::from(payload.block_step))),
            "operator" => Ok(Token::Address(operator)),
            other => Err(RelayerError::Config(format!(
                "{} has an argument the relayer cannot supply: {}",
                function.name, other
            ))),
        })
        .collect()
}

/// Max fee = 2 * base fee + priority fee, capped at the configured maximum
fn eip1559_fees(base_fee: U256, cap: U256) -> GasPrice {
    let priority = U256::from(PRIORITY_FEE_WEI);
    let max_fee = std::cmp::min(base_fee * 2 + priority, cap);
    GasPrice::Eip1559 {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: std::cmp::min(priority, max_fee),
    }
}

/// Reverts are permanent; everything else (transport, gas, nonce) is retryable
fn classify(chain_id: ChainId, message: &str) -> RelayerError {
    let lower = message.to_lowercase();
    if lower.contains("revert") || lower.contains("invalid opcode") {
        RelayerError::SubmissionReverted {
            chain_id,
            message: message.to_string(),
        }
    } else {
        RelayerError::TransientNetwork {
            chain_id,
            message: message.to_string(),
        }
    }
}
