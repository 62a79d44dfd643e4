//! State-sync commitments: a Merkle root over a contiguous, gap-free range of
//! root-chain events, certified by a quorum of validator signatures.

use crate::crypto::{verify_certificate, VerifyError};
use crate::events::StateSyncEvent;
use crate::merkle::MerkleTree;
use crate::validator::Epoch;
use crate::{Address, Hash};
use ethers::abi::Token;
use ethers::types::{Signature, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub start_id: u64,
    pub end_id: u64,
    pub root: Hash,
}

impl Commitment {
    /// Builds the commitment and its Merkle tree over a batch of events.
    /// The batch must be non-empty, ordered by id and contiguous.
    pub fn over(events: &[StateSyncEvent]) -> Option<(Self, MerkleTree)> {
        let first = events.first()?;
        let last = events.last()?;
        debug_assert!(events
            .windows(2)
            .all(|pair| pair[1].id == pair[0].id + 1));

        let tree = MerkleTree::from_leaves(events.iter().map(StateSyncEvent::leaf_hash).collect());
        let commitment = Self {
            start_id: first.id,
            end_id: last.id,
            root: tree.root(),
        };
        Some((commitment, tree))
    }

    pub fn contains(&self, id: u64) -> bool {
        (self.start_id..=self.end_id).contains(&id)
    }

    /// Position of `id` within the committed range.
    pub fn leaf_index(&self, id: u64) -> Option<u64> {
        self.contains(id).then(|| id - self.start_id)
    }

    /// Digest signed by validators: keccak over the ABI tuple
    /// `(start_id, end_id, root)`.
    pub fn digest(&self) -> Hash {
        Hash::from(keccak256(ethers::abi::encode(&[
            Token::Uint(U256::from(self.start_id)),
            Token::Uint(U256::from(self.end_id)),
            Token::FixedBytes(self.root.as_bytes().to_vec()),
        ])))
    }
}

/// A commitment plus the signer-indexed signature map; the key set doubles as
/// the signer list recorded on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommitment {
    pub commitment: Commitment,
    pub signatures: BTreeMap<Address, Signature>,
}

impl SignedCommitment {
    pub fn new(commitment: Commitment, signatures: BTreeMap<Address, Signature>) -> Self {
        Self {
            commitment,
            signatures,
        }
    }

    pub fn signers(&self) -> impl Iterator<Item = &Address> {
        self.signatures.keys()
    }

    /// Full certificate check against the epoch the commitment was signed in.
    pub fn verify(&self, epoch: &Epoch) -> Result<(), VerifyError> {
        verify_certificate(self.commitment.digest(), &self.signatures, epoch)
    }
}
