use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// "mainnet" or "testnet"; selects address prefix and hash domain.
    pub network: String,
    pub data_dir: String,
    /// Address credited by the built-in miner; empty disables mining.
    pub miner_address: String,
    pub mine: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    pub genesis_difficulty: u32,
    pub difficulty_window: u64,
    pub checkpoint_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolSection {
    pub max_size: usize,
    pub max_per_sender: usize,
    pub min_fee_rate: f64,
    pub max_age_secs: f64,
    pub invalid_threshold: u32,
    pub invalid_window_secs: f64,
    pub invalid_ban_secs: f64,
    pub max_per_block: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    pub chunk_size: usize,
    pub bandwidth_limit_bytes: u64,
    pub max_retries_per_chunk: u32,
    pub retry_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AurumConfig {
    pub node: NodeSection,
    pub api: ApiSection,
    pub consensus: ConsensusSection,
    pub mempool: MempoolSection,
    pub sync: SyncSection,
}

impl AurumConfig {
    /// Layer a TOML file under `AURUM__`-prefixed environment overrides
    /// (e.g. `AURUM__API__LISTEN_ADDR=0.0.0.0:9333`).
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("AURUM").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self {
            node: NodeSection {
                network: "testnet".into(),
                data_dir: "./aurum-data".into(),
                miner_address: String::new(),
                mine: false,
            },
            api: ApiSection {
                listen_addr: "127.0.0.1:8765".into(),
            },
            consensus: ConsensusSection {
                genesis_difficulty: 3,
                difficulty_window: 10,
                checkpoint_interval: 50,
            },
            mempool: MempoolSection {
                max_size: 5000,
                max_per_sender: 25,
                min_fee_rate: 0.0,
                max_age_secs: 3600.0,
                invalid_threshold: 5,
                invalid_window_secs: 300.0,
                invalid_ban_secs: 600.0,
                max_per_block: 500,
            },
            sync: SyncSection {
                chunk_size: 1_000_000,
                bandwidth_limit_bytes: 0,
                max_retries_per_chunk: 3,
                retry_rounds: 2,
            },
        }
    }
}
