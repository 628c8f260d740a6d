use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tessera_consensus::{ConsensusKind, LeaderRotation, TimeoutConfig, ValidatorEndpoint};
use tessera_core::{GenesisConfig, KeyPair, PublicKey, QuorumRule, SecretKey, ValidatorInfo};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chain ID
    pub chain_id: u64,

    /// Node data directory
    pub data_dir: PathBuf,

    /// RPC bind address
    pub rpc_addr: SocketAddr,

    /// Enable WebSocket
    #[serde(default = "default_true")]
    pub enable_ws: bool,

    /// Registered engine name: `HOTSTUFF`, `TBFT` or `SOLO`
    #[serde(default = "default_consensus")]
    pub consensus: String,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub leader_rotation: LeaderRotation,

    /// Upper bounds on one proposal's batch
    pub max_batch_txs: usize,
    pub max_batch_bytes: usize,

    /// Mempool max size
    pub mempool_max_size: usize,

    /// Mempool max per sender
    pub mempool_max_per_sender: usize,

    /// Per-request timeout for peer delivery
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    /// Genesis configuration
    pub genesis: GenesisConfigFile,

    /// Validator private key (hex)
    pub validator_key: String,
}

/// Genesis configuration for file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisConfigFile {
    pub timestamp: u64,
    #[serde(default)]
    pub quorum_rule: QuorumRule,
    pub validators: Vec<ValidatorEntry>,
}

/// One validator: identity, voting weight and the RPC address peers reach it on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub pubkey: String,
    #[serde(default = "default_weight")]
    pub weight: u64,
    pub address: String,
}

fn default_true() -> bool {
    true
}

fn default_consensus() -> String {
    ConsensusKind::default().name().to_string()
}

fn default_peer_timeout_ms() -> u64 {
    2000
}

fn default_weight() -> u64 {
    1
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            chain_id: 1,
            data_dir: PathBuf::from("./tessera-data"),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_ws: true,
            consensus: default_consensus(),
            timeouts: TimeoutConfig::default(),
            leader_rotation: LeaderRotation::default(),
            max_batch_txs: 1000,
            max_batch_bytes: 1 << 20,
            mempool_max_size: 10_000,
            mempool_max_per_sender: 100,
            peer_timeout_ms: default_peer_timeout_ms(),
            genesis: GenesisConfigFile::default(),
            validator_key: String::new(),
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn keypair(&self) -> Result<KeyPair> {
        let secret = SecretKey::from_hex(&self.validator_key)
            .map_err(|e| anyhow!("validator_key: {}", e))?;
        Ok(KeyPair::from_secret(secret))
    }

    /// Convert genesis config to core type
    pub fn to_genesis_config(&self) -> Result<GenesisConfig> {
        let validators = self
            .genesis
            .validators
            .iter()
            .map(|entry| {
                PublicKey::from_hex(&entry.pubkey)
                    .map(|pk| ValidatorInfo::new(pk, entry.weight))
                    .map_err(|e| anyhow!("validator {}: {}", entry.pubkey, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GenesisConfig {
            chain_id: self.chain_id,
            timestamp: self.genesis.timestamp,
            validators,
            quorum_rule: self.genesis.quorum_rule,
        })
    }

    /// Every other validator's endpoint
    pub fn peer_endpoints(&self, local: &PublicKey) -> Result<Vec<ValidatorEndpoint>> {
        let mut peers = Vec::new();
        for entry in &self.genesis.validators {
            let pubkey = PublicKey::from_hex(&entry.pubkey).map_err(|e| anyhow!("validator {}: {}", entry.pubkey, e))?;
            if pubkey != *local {
                peers.push(ValidatorEndpoint::new(pubkey, entry.address.clone()));
            }
        }
        Ok(peers)
    }
}

/// Configs for a local cluster of `count` validators sharing one genesis.
/// Validator `i` listens on `base_port + i` and keeps data under `node{i}`.
pub fn generate_cluster_configs(count: usize, consensus: &str, base_port: u16) -> Result<Vec<NodeConfig>> {
    if count == 0 {
        return Err(anyhow!("a cluster needs at least one validator"));
    }
    let keys: Vec<KeyPair> = (0..count).map(|_| KeyPair::generate()).collect();
    let ports = (0..count)
        .map(|i| {
            u16::try_from(i)
                .ok()
                .and_then(|i| base_port.checked_add(i))
                .ok_or_else(|| anyhow!("port range overflows from {}", base_port))
        })
        .collect::<Result<Vec<u16>>>()?;

    let genesis = GenesisConfigFile {
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default(),
        quorum_rule: QuorumRule::Byzantine,
        validators: keys
            .iter()
            .zip(&ports)
            .map(|(kp, port)| ValidatorEntry {
                pubkey: kp.public.to_hex(),
                weight: 1,
                address: format!("http://127.0.0.1:{}", port),
            })
            .collect(),
    };

    Ok(keys
        .iter()
        .zip(&ports)
        .enumerate()
        .map(|(i, (kp, port))| NodeConfig {
            data_dir: PathBuf::from(format!("./tessera-data/node{}", i)),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], *port)),
            consensus: consensus.to_ascii_uppercase(),
            genesis: genesis.clone(),
            validator_key: kp.secret.to_hex(),
            ..NodeConfig::default()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.consensus, "HOTSTUFF");
    }

    #[test]
    fn test_cluster_configs_share_genesis() {
        let configs = generate_cluster_configs(4, "tbft", 9000).unwrap();
        assert_eq!(configs.len(), 4);
        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.consensus, "TBFT");
            assert_eq!(config.rpc_addr.port(), 9000 + i as u16);
            assert_eq!(config.genesis.validators.len(), 4);

            let kp = config.keypair().unwrap();
            assert_eq!(config.genesis.validators[i].pubkey, kp.public.to_hex());
            assert_eq!(config.peer_endpoints(&kp.public).unwrap().len(), 3);
        }
        let genesis = configs[0].to_genesis_config().unwrap();
        assert_eq!(genesis.validator_set().unwrap().total_weight(), 4);
    }

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(generate_cluster_configs(0, "HOTSTUFF", 8080).is_err());
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let kp = KeyPair::from_seed(1);
        let json = serde_json::json!({
            "chain_id": 3,
            "data_dir": "/tmp/tessera",
            "rpc_addr": "127.0.0.1:9100",
            "max_batch_txs": 10,
            "max_batch_bytes": 4096,
            "mempool_max_size": 100,
            "mempool_max_per_sender": 10,
            "genesis": {
                "timestamp": 0,
                "validators": [{ "pubkey": kp.public.to_hex(), "address": "http://127.0.0.1:9100" }]
            },
            "validator_key": kp.secret.to_hex()
        });
        let config: NodeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.consensus, "HOTSTUFF");
        assert!(config.enable_ws);
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert_eq!(config.genesis.validators[0].weight, 1);
        assert_eq!(config.genesis.quorum_rule, QuorumRule::Byzantine);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let configs = generate_cluster_configs(1, "HOTSTUFF", 8080).unwrap();
        configs[0].save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.validator_key, configs[0].validator_key);
        assert_eq!(loaded.genesis.validators.len(), 1);
    }
}
