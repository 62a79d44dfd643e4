//! Checkpoints: quorum-signed summaries of child-chain progress submitted to
//! the root chain. A finalized checkpoint's event root is the proof root for
//! exits in its epoch.

use crate::crypto::{verify_certificate, VerifyError};
use crate::validator::Epoch;
use crate::{Address, Hash};
use ethers::abi::Token;
use ethers::types::{Signature, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub start_block: u64,
    pub end_block: u64,
    /// Merkle root over the exit events observed in the block range.
    pub event_root: Hash,
    /// Hash of the last child block in the range.
    pub block_hash: Hash,
}

impl Checkpoint {
    /// Digest signed by validators: keccak over the ABI tuple
    /// `(epoch, event_root, block_hash)`.
    pub fn digest(&self) -> Hash {
        Hash::from(keccak256(ethers::abi::encode(&[
            Token::Uint(U256::from(self.epoch)),
            Token::FixedBytes(self.event_root.as_bytes().to_vec()),
            Token::FixedBytes(self.block_hash.as_bytes().to_vec()),
        ])))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCheckpoint {
    pub checkpoint: Checkpoint,
    pub signatures: BTreeMap<Address, Signature>,
}

impl SignedCheckpoint {
    pub fn new(checkpoint: Checkpoint, signatures: BTreeMap<Address, Signature>) -> Self {
        Self {
            checkpoint,
            signatures,
        }
    }

    pub fn verify(&self, epoch: &Epoch) -> Result<(), VerifyError> {
        verify_certificate(self.checkpoint.digest(), &self.signatures, epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{authority_key_from_bytes, sign_digest};
    use crate::validator::Validator;
    use ethers::signers::Signer;

    #[test]
    fn test_digest_binds_epoch_and_roots() {
        let checkpoint = Checkpoint {
            epoch: 5,
            start_block: 41,
            end_block: 50,
            event_root: Hash::repeat_byte(1),
            block_hash: Hash::repeat_byte(2),
        };
        let mut other = checkpoint;
        other.epoch = 6;
        assert_ne!(checkpoint.digest(), other.digest());

        let mut other = checkpoint;
        other.event_root = Hash::repeat_byte(3);
        assert_ne!(checkpoint.digest(), other.digest());
    }

    #[test]
    fn test_signed_checkpoint_roundtrip_verify() {
        let mut bytes = [0u8; 32];
        bytes[31] = 3;
        let key = authority_key_from_bytes(&bytes).unwrap();
        let epoch = Epoch::new(1, vec![Validator::new(key.address(), 100, vec![])], 1);

        let checkpoint = Checkpoint {
            epoch: 1,
            start_block: 1,
            end_block: 10,
            event_root: Hash::repeat_byte(7),
            block_hash: Hash::repeat_byte(8),
        };
        let mut signatures = BTreeMap::new();
        signatures.insert(
            key.address(),
            sign_digest(&key, checkpoint.digest()).unwrap(),
        );
        SignedCheckpoint::new(checkpoint, signatures)
            .verify(&epoch)
            .unwrap();
    }
}
