//! Deterministic fixtures shared by the crate's tests.

use crate::metrics::BridgeMetrics;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::crypto::{authority_key_from_bytes, AuthorityKeyPair};
use arbor_bridge_types::{
    Address, Commitment, Epoch, ExitEvent, StateSyncEvent, Validator,
};
use ethers::signers::Signer;
use std::sync::Arc;

/// Deterministic secp256k1 keys seeded 1..=n.
pub fn test_keys(n: usize) -> Vec<AuthorityKeyPair> {
    (1..=n as u8)
        .map(|seed| {
            let mut bytes = [0u8; 32];
            bytes[31] = seed;
            authority_key_from_bytes(&bytes).expect("valid test key")
        })
        .collect()
}

pub fn test_validators(keys: &[AuthorityKeyPair], powers: &[u64]) -> Vec<Validator> {
    keys.iter()
        .zip(powers)
        .map(|(key, power)| Validator::new(key.address(), *power, vec![]))
        .collect()
}

/// Genesis epoch with the given voting powers.
pub fn test_epoch(keys: &[AuthorityKeyPair], powers: &[u64]) -> Epoch {
    Epoch::new(1, test_validators(keys, powers), 1)
}

pub fn state_sync_events(range: std::ops::RangeInclusive<u64>) -> Vec<StateSyncEvent> {
    range
        .map(|id| StateSyncEvent {
            id,
            source: Address::repeat_byte(0xaa),
            target: Address::repeat_byte(0xcc),
            data: id.to_be_bytes().to_vec(),
        })
        .collect()
}

pub fn exit_events(range: std::ops::RangeInclusive<u64>) -> Vec<ExitEvent> {
    range
        .map(|id| ExitEvent {
            id,
            sender: Address::repeat_byte(0xbb),
            receiver: Address::repeat_byte(0xdd),
            data: id.to_be_bytes().to_vec(),
        })
        .collect()
}

pub fn test_commitment(start_id: u64, end_id: u64) -> Commitment {
    let (commitment, _) = Commitment::over(&state_sync_events(start_id..=end_id))
        .expect("non-empty range");
    commitment
}

pub fn test_store() -> (tempfile::TempDir, Arc<BridgeOrchestratorStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = BridgeOrchestratorStore::new(dir.path()).expect("open store");
    (dir, Arc::new(store))
}

pub fn test_metrics() -> Arc<BridgeMetrics> {
    Arc::new(BridgeMetrics::new_for_testing())
}
