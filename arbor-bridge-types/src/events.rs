//! Bridge event structs observed on the two chains, together with their
//! canonical ABI leaf encodings used when building Merkle commitments.

use crate::{Address, Hash};
use ethers::abi::Token;
use ethers::types::U256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Event emitted by the root chain's state sender; ids increase by one per
/// event and each id is consumed exactly once on the child chain.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSyncEvent {
    pub id: u64,
    pub source: Address,
    pub target: Address,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
}

impl StateSyncEvent {
    pub fn abi_encode(&self) -> Vec<u8> {
        ethers::abi::encode(&[
            Token::Uint(U256::from(self.id)),
            Token::Address(self.source),
            Token::Address(self.target),
            Token::Bytes(self.data.clone()),
        ])
    }

    /// Merkle leaf: keccak of the canonical ABI tuple.
    pub fn leaf_hash(&self) -> Hash {
        Hash::from(keccak256(self.abi_encode()))
    }
}

/// Withdrawal event emitted by the child chain's state sender, proven against
/// a finalized checkpoint and settled on the root chain.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub id: u64,
    pub sender: Address,
    pub receiver: Address,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
}

impl ExitEvent {
    pub fn abi_encode(&self) -> Vec<u8> {
        ethers::abi::encode(&[
            Token::Uint(U256::from(self.id)),
            Token::Address(self.sender),
            Token::Address(self.receiver),
            Token::Bytes(self.data.clone()),
        ])
    }

    pub fn leaf_hash(&self) -> Hash {
        Hash::from(keccak256(self.abi_encode()))
    }
}

/// Validator-set contract events observed on the root chain. These only touch
/// pending voting power; they take effect at the next epoch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorSetEvent {
    AddedToWhitelist {
        validator: Address,
    },
    NewValidator {
        validator: Address,
        public_key: Vec<u8>,
    },
    Staked {
        validator: Address,
        amount: u64,
    },
    Unstaked {
        validator: Address,
        amount: u64,
    },
}
