//! The bridge error taxonomy. Retryable kinds (`Submission`, `QuorumNotMet`,
//! `Gap`) recover locally with bounded attempts; `ReplayRejected` is a benign
//! no-op surfaced to the caller; decode failures are fatal to the offending
//! message only.

use arbor_bridge_types::crypto::VerifyError;
use arbor_bridge_types::transaction::DecodeError;
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("quorum not met: {signed} of {total} voting power")]
    QuorumNotMet { signed: u64, total: u64 },
    #[error("sequence gap: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("id {0} already processed")]
    ReplayRejected(u64),
    #[error("merkle proof rejected: {0}")]
    ProofInvalid(String),
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("checkpoint for epoch {epoch} is not ahead of finalized epoch {last_finalized}")]
    StaleCheckpoint { epoch: u64, last_finalized: u64 },
    #[error("root chain reorg invalidated the checkpoint for epoch {0}")]
    ReorgDetected(u64),
    #[error("signing failure: {0}")]
    Signing(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    Generic(String),
}

impl BridgeError {
    /// Whether local retry is expected to make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::QuorumNotMet { .. }
                | BridgeError::Gap { .. }
                | BridgeError::Submission(_)
        )
    }
}

impl From<VerifyError> for BridgeError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::QuorumNotMet { signed, total } => {
                BridgeError::QuorumNotMet { signed, total }
            }
            other => BridgeError::Signing(other.to_string()),
        }
    }
}

impl From<sled::Error> for BridgeError {
    fn from(err: sled::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::Submission("timeout".into()).is_retryable());
        assert!(BridgeError::QuorumNotMet {
            signed: 1,
            total: 3
        }
        .is_retryable());
        assert!(!BridgeError::ReplayRejected(4).is_retryable());
        assert!(!BridgeError::ProofInvalid("bad path".into()).is_retryable());
    }

    #[test]
    fn test_verify_error_mapping() {
        let err: BridgeError = VerifyError::QuorumNotMet {
            signed: 2,
            total: 9,
        }
        .into();
        assert!(matches!(
            err,
            BridgeError::QuorumNotMet {
                signed: 2,
                total: 9
            }
        ));
    }
}
