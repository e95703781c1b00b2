use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

/// Upper bound on confidants per round; confidant indices are a single byte.
pub const MAX_CONFIDANTS: usize = 255;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub conveyer: ConveyerLimits,
    #[serde(default)]
    pub rounds: RoundLimits,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            conveyer: ConveyerLimits::default(),
            rounds: RoundLimits::default(),
        }
    }
}

/// Capacity limits of the transaction conveyer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConveyerLimits {
    #[serde(default = "default_max_packet_transactions")]
    pub max_packet_transactions: usize,
    #[serde(default = "default_max_packets_per_round")]
    pub max_packets_per_round: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// How many past rounds keep their packet tables for lookup and backfill.
    #[serde(default = "default_meta_capacity")]
    pub meta_capacity: u64,
}

fn default_max_packet_transactions() -> usize {
    100
}

fn default_max_packets_per_round() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1_000_000
}

fn default_meta_capacity() -> u64 {
    // equals RoundLimits::max_rounds_cancel_contract so a duplicated new_state
    // can always be resolved against a retained round table
    100
}

impl Default for ConveyerLimits {
    fn default() -> Self {
        Self {
            max_packet_transactions: default_max_packet_transactions(),
            max_packets_per_round: default_max_packets_per_round(),
            max_queue_size: default_max_queue_size(),
            meta_capacity: default_meta_capacity(),
        }
    }
}

/// Round-based timeouts of the contract execution queue.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RoundLimits {
    /// Soft limit: a Running contract is preempted after this many blocks.
    #[serde(default = "default_max_rounds_execute")]
    pub max_rounds_execute_contract: u64,
    /// Hard limit: the queue item is closed and dropped after this many blocks.
    #[serde(default = "default_max_rounds_cancel")]
    pub max_rounds_cancel_contract: u64,
}

fn default_max_rounds_execute() -> u64 {
    50
}

fn default_max_rounds_cancel() -> u64 {
    100
}

impl Default for RoundLimits {
    fn default() -> Self {
        Self {
            max_rounds_execute_contract: default_max_rounds_execute(),
            max_rounds_cancel_contract: default_max_rounds_cancel(),
        }
    }
}
