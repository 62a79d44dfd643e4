//! Node configuration. Kebab-case serde structs loaded through
//! `arbor_bridge_config::Config`; `validate()` checks the cross-field
//! invariants the components rely on before anything starts.

use crate::error::{BridgeError, BridgeResult};
use arbor_bridge_types::crypto::{authority_key_from_bytes, AuthorityKeyPair};
use arbor_bridge_types::{Address, Epoch, Validator};
use arbor_bridge_config::Config;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

fn default_query_interval_ms() -> u64 {
    2_000
}

fn default_signing_timeout_ms() -> u64 {
    10_000
}

fn default_submission_retry_ms() -> u64 {
    30_000
}

fn default_gap_alert_after() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RootChainConfig {
    /// State sender contract emitting state-sync events.
    pub state_sender_address: Address,
    /// Validator-set contract emitting stake/whitelist events.
    pub validator_set_address: Address,
    /// Checkpoint manager contract checkpoints are submitted to.
    pub checkpoint_manager_address: Address,
    /// Exit helper contract exits are settled through.
    pub exit_helper_address: Address,
    /// ERC-20 predicate deposits enter through.
    pub erc20_predicate_address: Address,
    #[serde(default = "default_query_interval_ms")]
    pub query_interval_ms: u64,
    /// First root block to scan when no cursor is stored.
    pub start_block_fallback: u64,
    /// Overrides the stored cursor; reprocesses from this block. Reset it
    /// after a restart or events are reprocessed every time.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub start_block_override: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChildChainConfig {
    /// State receiver contract commitments are delivered to.
    pub state_receiver_address: Address,
    /// ERC-20 predicate withdrawals leave through.
    pub erc20_predicate_address: Address,
    #[serde(default = "default_query_interval_ms")]
    pub query_interval_ms: u64,
    /// Child blocks per epoch; checkpoints are sealed at these boundaries.
    pub epoch_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommitmentConfig {
    /// Events per commitment batch.
    pub batch_size: usize,
    /// A partial batch is cut once its oldest event has waited this long.
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointConfig {
    #[serde(default = "default_signing_timeout_ms")]
    pub signing_timeout_ms: u64,
    #[serde(default = "default_submission_retry_ms")]
    pub submission_retry_ms: u64,
    /// Polling rounds a buffered gap may stall before it is escalated to a
    /// desynchronization alert.
    #[serde(default = "default_gap_alert_after")]
    pub gap_alert_after: u32,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GenesisValidator {
    pub address: Address,
    pub voting_power: u64,
    #[serde_as(as = "serde_with::hex::Hex")]
    #[serde(default)]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeNodeConfig {
    /// Client storage path.
    pub db_path: PathBuf,
    /// File holding the hex-encoded secp256k1 authority key.
    pub authority_key_path: PathBuf,
    pub root_chain: RootChainConfig,
    pub child_chain: ChildChainConfig,
    pub commitment: CommitmentConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub genesis_validators: Vec<GenesisValidator>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            signing_timeout_ms: default_signing_timeout_ms(),
            submission_retry_ms: default_submission_retry_ms(),
            gap_alert_after: default_gap_alert_after(),
        }
    }
}

impl Config for BridgeNodeConfig {}

impl BridgeNodeConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.commitment.batch_size == 0 {
            return Err(BridgeError::Generic(
                "commitment batch-size must be at least 1".into(),
            ));
        }
        if self.child_chain.epoch_length == 0 {
            return Err(BridgeError::Generic(
                "child-chain epoch-length must be at least 1".into(),
            ));
        }
        if self.genesis_validators.is_empty() {
            return Err(BridgeError::Generic(
                "genesis-validators must not be empty".into(),
            ));
        }
        if self.genesis_validators.iter().all(|v| v.voting_power == 0) {
            return Err(BridgeError::Generic(
                "genesis validator set has no voting power".into(),
            ));
        }
        Ok(())
    }

    /// Reads the hex-encoded authority key from `authority_key_path`.
    pub fn load_authority_key(&self) -> BridgeResult<AuthorityKeyPair> {
        let content = std::fs::read_to_string(&self.authority_key_path).map_err(|e| {
            BridgeError::Generic(format!(
                "failed to read authority key from {:?}: {e}",
                self.authority_key_path
            ))
        })?;
        let bytes = hex::decode(content.trim().trim_start_matches("0x")).map_err(|e| {
            BridgeError::Generic(format!("authority key is not valid hex: {e}"))
        })?;
        authority_key_from_bytes(&bytes).map_err(|e| BridgeError::Signing(e.to_string()))
    }

    /// The epoch the registry starts from.
    pub fn genesis_epoch(&self) -> Epoch {
        let validators = self
            .genesis_validators
            .iter()
            .map(|v| Validator::new(v.address, v.voting_power, v.public_key.clone()))
            .collect();
        Epoch::new(1, validators, 1)
    }

    pub fn root_query_interval(&self) -> Duration {
        Duration::from_millis(self.root_chain.query_interval_ms)
    }

    pub fn child_query_interval(&self) -> Duration {
        Duration::from_millis(self.child_chain.query_interval_ms)
    }

    pub fn commitment_max_wait(&self) -> Duration {
        Duration::from_millis(self.commitment.max_wait_ms)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint.signing_timeout_ms)
    }

    pub fn submission_retry(&self) -> Duration {
        Duration::from_millis(self.checkpoint.submission_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(dir: &std::path::Path) -> BridgeNodeConfig {
        BridgeNodeConfig {
            db_path: dir.join("db"),
            authority_key_path: dir.join("authority.key"),
            root_chain: RootChainConfig {
                state_sender_address: Address::repeat_byte(0x51),
                validator_set_address: Address::repeat_byte(0x52),
                checkpoint_manager_address: Address::repeat_byte(0x53),
                exit_helper_address: Address::repeat_byte(0x54),
                erc20_predicate_address: Address::repeat_byte(0x55),
                query_interval_ms: default_query_interval_ms(),
                start_block_fallback: 1,
                start_block_override: None,
            },
            child_chain: ChildChainConfig {
                state_receiver_address: Address::repeat_byte(0x61),
                erc20_predicate_address: Address::repeat_byte(0x62),
                query_interval_ms: default_query_interval_ms(),
                epoch_length: 10,
            },
            commitment: CommitmentConfig {
                batch_size: 5,
                max_wait_ms: 1_000,
            },
            checkpoint: CheckpointConfig::default(),
            genesis_validators: vec![GenesisValidator {
                address: Address::repeat_byte(1),
                voting_power: 100,
                public_key: vec![],
            }],
        }
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let path = dir.path().join("bridge.json");
        config.save(&path).unwrap();
        let loaded = BridgeNodeConfig::load(&path).unwrap();
        assert_eq!(
            loaded.root_chain.state_sender_address,
            config.root_chain.state_sender_address
        );
        assert_eq!(loaded.commitment.batch_size, 5);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_degenerate_configs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.commitment.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config(dir.path());
        config.child_chain.epoch_length = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config(dir.path());
        config.genesis_validators.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_authority_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        std::fs::write(
            &config.authority_key_path,
            "0x0000000000000000000000000000000000000000000000000000000000000007\n",
        )
        .unwrap();
        let key = config.load_authority_key().unwrap();
        use ethers::signers::Signer;
        assert_ne!(key.address(), Address::zero());
    }

    #[test]
    fn test_genesis_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let epoch = config.genesis_epoch();
        assert_eq!(epoch.number, 1);
        assert_eq!(epoch.total_voting_power(), 100);
    }
}
