//! Configuration management for EscrowChain

use crate::error::ChainError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Highest difficulty (leading zero hex characters) a node accepts.
pub const MAX_DIFFICULTY: u32 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_block_reward")]
    pub block_reward: Decimal,
    #[serde(default = "default_halving_interval")]
    pub halving_interval: u64,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    /// Credited to an address when its public key is registered.
    #[serde(default = "default_initial_wallet_balance")]
    pub initial_wallet_balance: Decimal,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_reward: default_block_reward(),
            halving_interval: default_halving_interval(),
            difficulty: default_difficulty(),
            initial_wallet_balance: default_initial_wallet_balance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            progress_log_interval: default_progress_log_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscrowConfig {
    #[serde(default = "default_escrow_address")]
    pub address: String,
    #[serde(default = "default_mediator_address")]
    pub mediator_address: String,
    #[serde(default = "default_escrow_initial_balance")]
    pub initial_balance: Decimal,
    /// Only accept delivery confirmation once the seller has shipped.
    #[serde(default = "default_strict_delivery")]
    pub strict_delivery: bool,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            address: default_escrow_address(),
            mediator_address: default_mediator_address(),
            initial_balance: default_escrow_initial_balance(),
            strict_delivery: default_strict_delivery(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate critical values
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.chain.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "chain.difficulty must be between 0 and {}, got {}",
                MAX_DIFFICULTY, self.chain.difficulty
            )));
        }
        if self.chain.halving_interval == 0 {
            return Err(ChainError::ConfigError(
                "chain.halving_interval must be greater than zero".to_string(),
            ));
        }
        if self.chain.block_reward < Decimal::ZERO || self.chain.initial_wallet_balance < Decimal::ZERO {
            return Err(ChainError::ConfigError(
                "chain rewards and allocations cannot be negative".to_string(),
            ));
        }
        if self.miner.max_attempts == 0 {
            return Err(ChainError::ConfigError(
                "miner.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.escrow.address.is_empty() || self.escrow.mediator_address.is_empty() {
            return Err(ChainError::ConfigError(
                "escrow.address and escrow.mediator_address must be set".to_string(),
            ));
        }
        if self.escrow.address == self.escrow.mediator_address {
            return Err(ChainError::ConfigError(
                "escrow.address and escrow.mediator_address must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `path`, falling back to defaults when the file is absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = fs::read_to_string(path)?;
    Config::from_toml_str(&config_str)
}

fn default_block_reward() -> Decimal {
    Decimal::from(10)
}

fn default_halving_interval() -> u64 {
    2
}

fn default_difficulty() -> u32 {
    4
}

fn default_initial_wallet_balance() -> Decimal {
    Decimal::from(10)
}

fn default_max_attempts() -> u64 {
    1_000_000
}

fn default_progress_log_interval() -> u64 {
    100
}

fn default_escrow_address() -> String {
    "escrow_contract".to_string()
}

fn default_mediator_address() -> String {
    "mediator".to_string()
}

fn default_escrow_initial_balance() -> Decimal {
    Decimal::from(1000)
}

fn default_strict_delivery() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
