//! Value types shared between the arbor bridge node and its chain-facing
//! components: the canonical transaction codec, bridge event structs, Merkle
//! commitments, validator/epoch snapshots and the quorum arithmetic evaluated
//! against them.

pub mod checkpoint;
pub mod commitment;
pub mod crypto;
pub mod events;
pub mod merkle;
pub mod transaction;
pub mod validator;

/// 20-byte account identifier, compared by byte equality.
pub type Address = ethers::types::H160;

/// 32-byte digest, compared by byte equality.
pub type Hash = ethers::types::H256;

pub use checkpoint::{Checkpoint, SignedCheckpoint};
pub use commitment::{Commitment, SignedCommitment};
pub use events::{ExitEvent, StateSyncEvent, ValidatorSetEvent};
pub use merkle::{MerkleProof, MerkleTree};
pub use transaction::{Transaction, TxKind, STATE_TRANSACTION_GAS_LIMIT};
pub use validator::{Epoch, Validator};
