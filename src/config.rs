//! Configuration management for the TIMPAL node

use crate::blockchain::GenesisSpec;
use crate::crypto::{address_from_hex, KeyPair};
use crate::error::ChainError;
use crate::transaction::DeviceFingerprint;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub chain: ChainParams,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// A peer that sends nothing for this long is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            p2p_port: default_p2p_port(),
            bootstrap_peers: Vec::new(),
            max_peers: default_max_peers(),
            idle_timeout_secs: default_idle_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MempoolConfig {
    #[serde(default = "default_mempool_size")]
    pub max_size: usize,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_mempool_size(),
            retention_secs: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hex secret key of this node's device key. Generated on startup when absent.
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl ValidatorConfig {
    pub fn keypair(&self) -> Result<KeyPair, ChainError> {
        match &self.secret_key {
            Some(hex_key) => KeyPair::from_secret_hex(hex_key),
            None => KeyPair::generate(),
        }
    }
}

/// Consensus constants that differ between mainnet and test networks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub chain_id: String,
    pub transition_height: u64,
    pub epoch_length: u64,
    pub checkpoint_interval: u64,
    pub max_reorg_depth: u64,
    /// A competing chain this much longer may override checkpoints and the depth limit.
    pub network_recovery_threshold: u64,
    /// Reorgs at least this deep need the coin-weight check.
    pub attack_reorg_threshold: u64,
    pub max_txs_per_block: usize,
    pub max_future_drift_secs: u64,
    pub block_time_secs: u64,
    /// Length of each fallback proposer window after the parent block.
    pub fallback_window_secs: u64,
    pub max_sync_batch: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_id: "timpal-mainnet".to_string(),
            transition_height: 5_000_000,
            epoch_length: 100,
            checkpoint_interval: 100,
            max_reorg_depth: 80,
            network_recovery_threshold: 100,
            attack_reorg_threshold: 4,
            max_txs_per_block: 1_350,
            max_future_drift_secs: 300,
            block_time_secs: 3,
            fallback_window_secs: 1,
            max_sync_batch: 50,
        }
    }
}

impl ChainParams {
    /// Latest finalized height. The block there and everything below it is never replaced.
    pub fn latest_checkpoint(&self, height: u64) -> u64 {
        if self.checkpoint_interval == 0 {
            return 0;
        }
        height / self.checkpoint_interval * self.checkpoint_interval
    }

    /// Earliest timestamp (ms) a rank-`rank` proposer may stamp on a child of `parent_timestamp`.
    pub fn fallback_opens_at(&self, parent_timestamp: u64, rank: u32) -> u64 {
        parent_timestamp.saturating_add(rank as u64 * self.fallback_window_secs * 1_000)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub allocations: Vec<AllocationEntry>,
    #[serde(default)]
    pub validators: Vec<GenesisValidatorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationEntry {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisValidatorEntry {
    pub address: String,
    pub device_fingerprint: String,
}

impl GenesisConfig {
    pub fn to_spec(&self) -> Result<GenesisSpec, ChainError> {
        let allocations = self
            .allocations
            .iter()
            .map(|a| Ok((address_from_hex(&a.address)?, a.amount)))
            .collect::<Result<Vec<_>, ChainError>>()?;
        let validators = self
            .validators
            .iter()
            .map(|v| {
                Ok((
                    address_from_hex(&v.address)?,
                    DeviceFingerprint::from_hex(&v.device_fingerprint)?,
                ))
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        let spec = GenesisSpec {
            timestamp: self.timestamp,
            allocations,
            validators,
        };
        spec.total_allocation()?;
        Ok(spec)
    }
}

/// Read `path`, or fall back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<Config, ChainError> {
    let config: Config = if path.exists() {
        let config_str = fs::read_to_string(path)?;
        toml::from_str(&config_str)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate critical values
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.storage.data_dir.is_empty() {
            return Err(ChainError::ConfigError("storage.data_dir must be set".to_string()));
        }
        if self.chain.epoch_length == 0 {
            return Err(ChainError::ConfigError("chain.epoch_length must be positive".to_string()));
        }
        if self.chain.fallback_window_secs == 0 {
            return Err(ChainError::ConfigError(
                "chain.fallback_window_secs must be positive".to_string(),
            ));
        }
        if self.chain.transition_height == 0 {
            return Err(ChainError::ConfigError(
                "chain.transition_height must be at least 1".to_string(),
            ));
        }
        if self.chain.max_sync_batch == 0 || self.chain.max_txs_per_block == 0 {
            return Err(ChainError::ConfigError(
                "chain.max_sync_batch and chain.max_txs_per_block must be positive".to_string(),
            ));
        }
        if self.mempool.max_size == 0 {
            return Err(ChainError::ConfigError("mempool.max_size must be positive".to_string()));
        }

        let spec = self.genesis.to_spec()?;
        let mut seen = BTreeSet::new();
        for (_, fingerprint) in &spec.validators {
            if !seen.insert(*fingerprint) {
                return Err(ChainError::ConfigError(format!(
                    "genesis device fingerprint {} is listed twice",
                    fingerprint.to_hex()
                )));
            }
        }
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    8765
}

fn default_max_peers() -> usize {
    32
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_mempool_size() -> usize {
    10_000
}

fn default_retention() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.chain, ChainParams::default());
        assert_eq!(config.chain.transition_height, 5_000_000);
        assert_eq!(config.mempool.max_size, 10_000);
        assert_eq!(config.network.p2p_port, 8765);
    }

    #[test]
    fn test_parses_genesis_and_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let addr = hex::encode(sha256(b"alice"));
        let fp = hex::encode(sha256(b"device"));
        fs::write(
            &path,
            format!(
                r#"
[chain]
chain_id = "timpal-devnet"
transition_height = 20

[genesis]
timestamp = 1700000000000
allocations = [{{ address = "{addr}", amount = 500 }}]
validators = [{{ address = "{addr}", device_fingerprint = "{fp}" }}]
"#
            ),
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.chain.chain_id, "timpal-devnet");
        assert_eq!(config.chain.transition_height, 20);
        assert_eq!(config.chain.epoch_length, 100);

        let spec = config.genesis.to_spec().unwrap();
        assert_eq!(spec.allocations, vec![(sha256(b"alice"), 500)]);
        assert_eq!(spec.validators[0].1, DeviceFingerprint(sha256(b"device")));
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[chain]\nepoch_length = 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(ChainError::ConfigError(_))));

        fs::write(
            &path,
            "[genesis]\nallocations = [{ address = \"zz\", amount = 1 }]\n",
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_checkpoints() {
        let params = ChainParams::default();
        assert_eq!(params.latest_checkpoint(99), 0);
        assert_eq!(params.latest_checkpoint(250), 200);
    }
}
