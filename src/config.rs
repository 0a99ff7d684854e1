//! Configuration management for the bridge relayer
//!
//! Settings come from `config/{env}.toml` (or the file named by
//! `RELAYER_CONFIG`), with `${VAR}` placeholders substituted from the
//! environment and `RELAYER__SECTION__KEY` variables overriding file values.

use crate::retry::RetryPolicy;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use ethers::abi::Abi;
use ethers::types::Address;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deepest confirmation depth accepted for any chain
const MAX_CONFIRMATION_DEPTH: u64 = 10_000;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Queue carrying dispatcher tasks
    pub queue: String,
    /// How long a claimed message stays invisible to other consumers
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default = "default_broker_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

fn default_broker_poll_ms() -> u64 {
    500
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub poll_interval_ms: u64,
    pub start_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Growth factor applied after a chunk with no events
    pub chunk_size_increase: f64,
    /// Shrink factor applied after a failed `get_logs`
    pub chunk_size_decrease: f64,
    /// Consecutive undecodable logs tolerated before alerting
    pub max_consecutive_decode_failures: u32,
    pub retry: RetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            start_chunk_size: 20,
            min_chunk_size: 10,
            max_chunk_size: 10_000,
            chunk_size_increase: 2.0,
            chunk_size_decrease: 0.5,
            max_consecutive_decode_failures: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub lock_ttl_ms: u64,
    /// Redelivery delay when another worker holds the operation
    pub lock_busy_delay_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_ttl_ms: 120_000,
            lock_busy_delay_ms: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_busy_delay(&self) -> Duration {
        Duration::from_millis(self.lock_busy_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Environment variable holding the hex-encoded signing key
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "RELAYER_PRIVATE_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    /// Contract ABI JSON, either a bare ABI array or a build artifact with an `abi` field
    pub abi_path: PathBuf,
    /// Blocks an event must be buried under before it is acted on
    pub confirmation_depth: u64,
    /// First block to scan when no cursor has been persisted
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_receipt_timeout_secs() -> u64 {
    120
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

impl ChainConfig {
    pub fn contract_address(&self) -> Result<Address> {
        self.contract_address
            .parse()
            .with_context(|| format!("Chain {} has an invalid contract address", self.name))
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    /// Load the bridge contract ABI
    pub fn load_abi(&self) -> Result<Abi> {
        let raw = std::fs::read_to_string(&self.abi_path)
            .with_context(|| format!("Failed to read ABI file: {:?}", self.abi_path))?;
        let json: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("ABI file is not JSON: {:?}", self.abi_path))?;

        let abi = match json {
            serde_json::Value::Object(mut artifact) => artifact
                .remove("abi")
                .with_context(|| format!("ABI artifact has no abi field: {:?}", self.abi_path))?,
            other => other,
        };

        serde_json::from_value(abi)
            .with_context(|| format!("Failed to parse ABI: {:?}", self.abi_path))
    }
}

impl Settings {
    /// Load settings for an environment (`config/{env}.toml` unless
    /// `RELAYER_CONFIG` names another file)
    pub fn load(env_name: &str) -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("config/{}.toml", env_name)));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        // Substitute environment variables
        let raw = substitute_env_vars(&raw);

        let settings: Settings = Config::builder()
            .add_source(File::from_str(&raw, FileFormat::Toml))
            .add_source(
                Environment::with_prefix("RELAYER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = HashSet::new();
        for (name, chain) in &self.chains {
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} is configured more than once", chain.chain_id);
            }
            if !chain.enabled {
                continue;
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            chain.contract_address()?;
            if chain.confirmation_depth > MAX_CONFIRMATION_DEPTH {
                anyhow::bail!(
                    "Chain {} confirmation depth {} exceeds {}",
                    name,
                    chain.confirmation_depth,
                    MAX_CONFIRMATION_DEPTH
                );
            }
        }

        let listener = &self.listener;
        if listener.min_chunk_size == 0
            || listener.min_chunk_size > listener.max_chunk_size
            || !(listener.min_chunk_size..=listener.max_chunk_size)
                .contains(&listener.start_chunk_size)
        {
            anyhow::bail!(
                "Listener chunk sizes must satisfy 0 < min <= start <= max (got {}/{}/{})",
                listener.min_chunk_size,
                listener.start_chunk_size,
                listener.max_chunk_size
            );
        }
        if listener.chunk_size_increase < 1.0
            || !(0.0..=1.0).contains(&listener.chunk_size_decrease)
        {
            anyhow::bail!("Listener chunk size factors are out of range");
        }

        if self.dispatcher.workers == 0 {
            anyhow::bail!("Dispatcher needs at least one worker");
        }
        if self.dispatcher.retry.max_attempts == 0 || self.listener.retry.max_attempts == 0 {
            anyhow::bail!("Retry policies must allow at least one attempt");
        }
        if self.dispatcher.workers as u32 > self.database.max_connections {
            tracing::warn!(
                "Dispatcher workers ({}) exceed database connections ({})",
                self.dispatcher.workers,
                self.database.max_connections
            );
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get an enabled chain's config by chain ID
    pub fn chain(&self, chain_id: u64) -> Result<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.chain_id == chain_id && c.enabled)
            .with_context(|| format!("Chain {} is not configured or not enabled", chain_id))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref PLACEHOLDER: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid placeholder pattern");
    }

    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
