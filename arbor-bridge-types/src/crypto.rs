//! Digest signing and recovery for validator authorities. Authorities hold
//! secp256k1 keys and are identified by the derived 20-byte address; verifying
//! a signature means recovering the signer from the digest and comparing
//! addresses, so certificates never need to carry public keys.

use crate::validator::Epoch;
use crate::{Address, Hash};
use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{Signer, Wallet};
use ethers::types::{RecoveryMessage, Signature};
use std::collections::BTreeMap;
use thiserror::Error;

/// Secp256k1 authority keypair; the wallet form keeps the derived address
/// alongside the signing key.
pub type AuthorityKeyPair = Wallet<SigningKey>;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("signature failure: {0}")]
    Signature(String),
    #[error("signature recovers to {recovered:?}, claimed signer {claimed:?}")]
    SignerMismatch { claimed: Address, recovered: Address },
    #[error("signer {0:?} is not part of the validator set")]
    UnknownSigner(Address),
    #[error("quorum not met: {signed} of {total} voting power")]
    QuorumNotMet { signed: u64, total: u64 },
}

pub fn authority_key_from_bytes(bytes: &[u8]) -> Result<AuthorityKeyPair, VerifyError> {
    Wallet::from_bytes(bytes).map_err(|e| VerifyError::Signature(e.to_string()))
}

/// Signs a 32-byte digest directly (no message prefix re-hashing).
pub fn sign_digest(key: &AuthorityKeyPair, digest: Hash) -> Result<Signature, VerifyError> {
    key.sign_hash(digest)
        .map_err(|e| VerifyError::Signature(e.to_string()))
}

/// Recovers the signing address from a digest signature.
pub fn recover_signer(digest: Hash, signature: &Signature) -> Result<Address, VerifyError> {
    signature
        .recover(RecoveryMessage::Hash(digest))
        .map_err(|e| VerifyError::Signature(e.to_string()))
}

pub fn key_address(key: &AuthorityKeyPair) -> Address {
    key.address()
}

/// Verifies a signer→signature map over `digest` against an epoch snapshot:
/// every signature must recover to its claimed signer, every signer must be a
/// known validator, and the combined voting power must clear quorum.
pub fn verify_certificate(
    digest: Hash,
    signatures: &BTreeMap<Address, Signature>,
    epoch: &Epoch,
) -> Result<(), VerifyError> {
    for (claimed, signature) in signatures {
        let recovered = recover_signer(digest, signature)?;
        if &recovered != claimed {
            return Err(VerifyError::SignerMismatch {
                claimed: *claimed,
                recovered,
            });
        }
        if epoch.validator(claimed).is_none() {
            return Err(VerifyError::UnknownSigner(*claimed));
        }
    }
    if !epoch.quorum_met(signatures.keys()) {
        return Err(VerifyError::QuorumNotMet {
            signed: epoch.signed_voting_power(signatures.keys()),
            total: epoch.total_voting_power(),
        });
    }
    Ok(())
}
