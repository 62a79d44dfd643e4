//! Chain-facing seams. The node observes and drives both chains exclusively
//! through these async traits; transports (RPC, gossip) live behind them and
//! are out of scope for the core. Submission is serialized per signing key so
//! at most one unconfirmed transaction occupies a key's nonce slot at a time.

use crate::error::{BridgeError, BridgeResult};
use arbor_bridge_types::{
    Address, Checkpoint, Commitment, ExitEvent, Hash, StateSyncEvent, Transaction,
    ValidatorSetEvent,
};
use async_trait::async_trait;
use ethers::types::Signature;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fate of a submitted checkpoint on the root chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Not (yet) visible as accepted.
    Unknown,
    /// Accepted and canonical.
    Accepted,
    /// A reorganization dropped the containing block.
    Reorged,
}

/// Anything that accepts canonical transactions.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync + 'static {
    async fn submit_transaction(&self, tx: Transaction) -> BridgeResult<Hash>;
}

#[async_trait]
pub trait RootChainClient: TransactionSubmitter {
    async fn latest_block(&self) -> BridgeResult<u64>;

    /// State-sync events with ids strictly greater than `after_id`, in id
    /// order, at most `limit`.
    async fn query_state_sync_events(
        &self,
        after_id: u64,
        limit: usize,
    ) -> BridgeResult<Vec<StateSyncEvent>>;

    /// Validator-set contract events in the given block range.
    async fn query_validator_set_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<ValidatorSetEvent>>;

    /// Whether the checkpoint with this digest is accepted, pending, or was
    /// dropped by a reorg.
    async fn checkpoint_status(&self, epoch: u64, digest: Hash) -> BridgeResult<CheckpointStatus>;
}

#[async_trait]
pub trait ChildChainClient: TransactionSubmitter {
    async fn latest_block(&self) -> BridgeResult<u64>;

    async fn block_hash(&self, block: u64) -> BridgeResult<Hash>;

    /// Exit events emitted in the given block range, paired with the block
    /// that emitted them.
    async fn query_exit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<(u64, ExitEvent)>>;
}

/// A payload a validator is asked to co-sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningRequest {
    Commitment(Commitment),
    Checkpoint(Checkpoint),
}

impl SigningRequest {
    pub fn digest(&self) -> Hash {
        match self {
            SigningRequest::Commitment(c) => c.digest(),
            SigningRequest::Checkpoint(c) => c.digest(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SigningRequest::Commitment(_) => "commitment",
            SigningRequest::Checkpoint(_) => "checkpoint",
        }
    }
}

/// Remote validator endpoint for signature collection.
#[async_trait]
pub trait ValidatorClient: Send + Sync + 'static {
    async fn request_signature(&self, request: SigningRequest) -> BridgeResult<Signature>;
}

/// Serializes submissions per signing key: a new submission for a key waits
/// for the prior one's nonce slot to clear, avoiding nonce races.
pub struct SerializedSubmitter<C: TransactionSubmitter + ?Sized> {
    client: Arc<C>,
    slots: parking_lot::Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl<C: TransactionSubmitter + ?Sized> SerializedSubmitter<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn slot(&self, key: Address) -> Arc<Mutex<()>> {
        self.slots.lock().entry(key).or_default().clone()
    }

    /// Submits holding the key's slot until the client reports the
    /// transaction confirmed (i.e. `submit_transaction` returned).
    pub async fn submit(&self, key: Address, tx: Transaction) -> BridgeResult<Hash> {
        let slot = self.slot(key);
        let _guard = slot.lock().await;
        self.client
            .submit_transaction(tx)
            .await
            .map_err(|e| match e {
                err @ BridgeError::Submission(_) => err,
                other => BridgeError::Submission(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct SlowSubmitter {
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    #[async_trait]
    impl TransactionSubmitter for SlowSubmitter {
        async fn submit_transaction(&self, tx: Transaction) -> BridgeResult<Hash> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(tx.hash())
        }
    }

    #[tokio::test]
    async fn test_single_outstanding_submission_per_key() {
        let inner = Arc::new(SlowSubmitter {
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        });
        let submitter = Arc::new(SerializedSubmitter::new(inner.clone()));
        let key = Address::repeat_byte(1);

        let mut handles = vec![];
        for nonce in 0..4u64 {
            let submitter = submitter.clone();
            handles.push(tokio::spawn(async move {
                let tx = Transaction::state(nonce, Address::repeat_byte(9), vec![]);
                submitter.submit(key, tx).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(inner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_serialize() {
        let inner = Arc::new(SlowSubmitter {
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        });
        let submitter = Arc::new(SerializedSubmitter::new(inner.clone()));

        let mut handles = vec![];
        for key_byte in 1..=3u8 {
            let submitter = submitter.clone();
            handles.push(tokio::spawn(async move {
                let tx = Transaction::state(0, Address::repeat_byte(9), vec![]);
                submitter
                    .submit(Address::repeat_byte(key_byte), tx)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(inner.max_in_flight.load(Ordering::SeqCst) > 1);
    }
}
