//! Configuration management for the derivative client
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "DERIVATIVE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    pub contracts: ContractsConfig,
    pub assets: AssetsConfig,
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub client: ClientConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsConfig {
    pub factory_address: String,
    /// Instance shown by `show` and `serve` when none is given
    pub derivative_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// Underlying assets, keyed by the price feed that tracks them
    pub underlying: Vec<AssetEntry>,
    /// Collateral assets, keyed by their ERC-20 token address
    pub collateral: Vec<AssetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetEntry {
    pub symbol: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signing key
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub confirmation_timeout_secs: u64,
    pub snapshot_poll_interval_secs: u64,
    pub identity_poll_interval_secs: u64,
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

fn default_receipt_poll_interval_ms() -> u64 {
    1000
}

impl Settings {
    /// Load settings from `DERIVATIVE_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a configuration document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.is_empty() {
            anyhow::bail!("Network {} has no RPC URLs configured", self.network.name);
        }

        if self.network.confirmation_blocks == 0 {
            anyhow::bail!("confirmation_blocks must be at least 1");
        }

        if self.client.confirmation_timeout_secs == 0 {
            anyhow::bail!("confirmation_timeout_secs must be greater than zero");
        }

        parse_address("contracts.factory_address", &self.contracts.factory_address)?;
        if let Some(ref addr) = self.contracts.derivative_address {
            parse_address("contracts.derivative_address", addr)?;
        }

        validate_assets("underlying", &self.assets.underlying)?;
        validate_assets("collateral", &self.assets.collateral)?;

        if self.wallet.private_key_env.is_none() {
            tracing::warn!("No wallet configured - write operations will be unavailable");
        }

        Ok(())
    }

    pub fn factory_address(&self) -> Result<Address> {
        parse_address("contracts.factory_address", &self.contracts.factory_address)
    }

    pub fn derivative_address(&self) -> Result<Option<Address>> {
        self.contracts
            .derivative_address
            .as_deref()
            .map(|addr| parse_address("contracts.derivative_address", addr))
            .transpose()
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.client.confirmation_timeout_secs)
    }
}

/// Symbols and addresses must both be unique within a selector
fn validate_assets(kind: &str, entries: &[AssetEntry]) -> Result<()> {
    let mut symbols = HashSet::new();
    let mut addresses = HashSet::new();

    for entry in entries {
        let address = parse_address(&format!("assets.{}.{}", kind, entry.symbol), &entry.address)?;
        if !symbols.insert(entry.symbol.to_uppercase()) {
            anyhow::bail!("Duplicate {} asset symbol {}", kind, entry.symbol);
        }
        if !addresses.insert(address) {
            anyhow::bail!(
                "{} asset {} reuses address {:?} of another entry",
                kind,
                entry.symbol,
                address
            );
        }
    }

    Ok(())
}

pub(crate) fn parse_address(field: &str, value: &str) -> Result<Address> {
    value
        .parse::<Address>()
        .with_context(|| format!("Invalid address for {}: {:?}", field, value))
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
