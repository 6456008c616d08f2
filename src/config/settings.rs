use crate::core::{ChainParams, INITIAL_BLOCK_REWARD};
use crate::error::{BlockchainError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";

const DATA_DIR_KEY: &str = "LEDGER_DATA_DIR";
const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const DIFFICULTY_KEY: &str = "LEDGER_DIFFICULTY";
const SUPPLY_CAP_KEY: &str = "LEDGER_SUPPLY_CAP";
const PEER_TIMEOUT_KEY: &str = "LEDGER_PEER_TIMEOUT_MS";

/// Node settings, layered as defaults, then an optional TOML file, then the
/// environment. Passed explicitly into the engine; there is no global copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub node_address: String,
    /// Difficulty (leading zero bits) for newly mined blocks
    pub difficulty: u32,
    /// Lowest difficulty accepted for any block after genesis
    pub min_difficulty: u32,
    pub block_reward: u64,
    /// Cap on total emission in base units, unlimited when absent
    pub supply_cap: Option<u64>,
    pub max_transactions_per_block: usize,
    /// Hashes between cancellation checks and progress snapshots
    pub progress_interval: u64,
    /// How long finished mining jobs stay queryable
    pub job_retention_secs: u64,
    pub peer_timeout_ms: u64,
    pub randomize_nonce_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data"),
            node_address: DEFAULT_NODE_ADDR.to_string(),
            difficulty: 16,
            min_difficulty: 1,
            block_reward: INITIAL_BLOCK_REWARD,
            supply_cap: None,
            max_transactions_per_block: 1000,
            progress_interval: 10_000,
            job_retention_secs: 300,
            peer_timeout_ms: 5_000,
            randomize_nonce_start: true,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BlockchainError::Config(format!("{key}={value} is not a valid value")))
}

impl Config {
    /// Defaults, then `path` if given, then process environment
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                info!("Reading configuration from {}", path.display());
                Config::from_toml_str(&fs::read_to_string(path)?)?
            }
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.check()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay values found through `lookup` (the environment, in practice)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup(NODE_ADDRESS_KEY) {
            self.node_address = addr;
        }
        if let Some(value) = lookup(DIFFICULTY_KEY) {
            self.difficulty = parse_var(DIFFICULTY_KEY, &value)?;
        }
        if let Some(value) = lookup(SUPPLY_CAP_KEY) {
            self.supply_cap = match value.trim() {
                "" | "none" | "unlimited" => None,
                other => Some(parse_var(SUPPLY_CAP_KEY, other)?),
            };
        }
        if let Some(value) = lookup(PEER_TIMEOUT_KEY) {
            self.peer_timeout_ms = parse_var(PEER_TIMEOUT_KEY, &value)?;
        }
        debug!("Effective configuration: {self:?}");
        Ok(())
    }

    pub fn check(&self) -> Result<()> {
        if self.difficulty < self.min_difficulty {
            return Err(BlockchainError::Config(format!(
                "difficulty {} is below min_difficulty {}",
                self.difficulty, self.min_difficulty
            )));
        }
        if self.max_transactions_per_block == 0 {
            return Err(BlockchainError::Config(
                "max_transactions_per_block must be at least 1".to_string(),
            ));
        }
        if self.peer_timeout_ms == 0 {
            return Err(BlockchainError::Config(
                "peer_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            block_reward: self.block_reward,
            supply_cap: self.supply_cap,
            min_difficulty: self.min_difficulty,
        }
    }

    /// Extract node ID from address (e.g., "127.0.0.1:2001" -> "2001")
    pub fn node_id(&self) -> String {
        match self.node_address.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() => port.to_string(),
            _ => "default".to_string(),
        }
    }

    /// Per-node store directory, so several nodes can share one machine
    pub fn node_data_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node_{}", self.node_id()))
    }
}
