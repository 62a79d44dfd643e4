//! Validator-side signing responder. A validator never signs what it is
//! merely told: the handler re-derives the requested digest from its own view
//! of both chains and refuses mismatches, then signs with the authority key.
//! Responses are LRU-cached by digest so repeated collection rounds are
//! cheap. Transport is the caller's concern; in-process callers wrap the
//! handler in a `LocalValidatorClient`.

use crate::client::{ChildChainClient, RootChainClient, SigningRequest, ValidatorClient};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use arbor_bridge_types::crypto::{sign_digest, AuthorityKeyPair};
use arbor_bridge_types::{Commitment, ExitEvent, MerkleTree};
use async_trait::async_trait;
use ethers::types::Signature;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SIGNATURE_CACHE_SIZE: usize = 1000;
const EVENT_QUERY_LIMIT: usize = 4096;

pub struct SigningRequestHandler {
    key: AuthorityKeyPair,
    root_client: Arc<dyn RootChainClient>,
    child_client: Arc<dyn ChildChainClient>,
    cache: Mutex<LruCache<arbor_bridge_types::Hash, Signature>>,
    metrics: Arc<BridgeMetrics>,
}

impl SigningRequestHandler {
    pub fn new(
        key: AuthorityKeyPair,
        root_client: Arc<dyn RootChainClient>,
        child_client: Arc<dyn ChildChainClient>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            key,
            root_client,
            child_client,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIGNATURE_CACHE_SIZE).expect("nonzero cache size"),
            )),
            metrics,
        }
    }

    pub async fn handle_sign_request(&self, request: &SigningRequest) -> BridgeResult<Signature> {
        let digest = request.digest();
        if let Some(signature) = self.cache.lock().await.get(&digest) {
            return Ok(*signature);
        }

        match request {
            SigningRequest::Commitment(commitment) => self
                .verify_commitment(commitment)
                .await
                .tap_ok(|_| info!(start_id = commitment.start_id, "commitment verified locally"))?,
            SigningRequest::Checkpoint(checkpoint) => self
                .verify_checkpoint(checkpoint)
                .await
                .tap_ok(|_| info!(epoch = checkpoint.epoch, "checkpoint verified locally"))?,
        }

        let signature =
            sign_digest(&self.key, digest).map_err(|e| BridgeError::Signing(e.to_string()))?;
        self.metrics
            .signature_requests
            .with_label_values(&[request.kind(), "signed"])
            .inc();
        self.cache.lock().await.put(digest, signature);
        Ok(signature)
    }

    /// Recomputes the commitment root from the events this node itself
    /// observed on the root chain.
    async fn verify_commitment(&self, commitment: &Commitment) -> BridgeResult<()> {
        if commitment.start_id == 0 || commitment.end_id < commitment.start_id {
            return Err(BridgeError::ProofInvalid(
                "commitment range is malformed".into(),
            ));
        }
        let events = self
            .root_client
            .query_state_sync_events(commitment.start_id - 1, EVENT_QUERY_LIMIT)
            .await?;
        let wanted = (commitment.end_id - commitment.start_id + 1) as usize;
        let observed: Vec<_> = events
            .into_iter()
            .take_while(|e| e.id <= commitment.end_id)
            .collect();
        if observed.len() != wanted
            || observed.first().map(|e| e.id) != Some(commitment.start_id)
        {
            warn!(
                start_id = commitment.start_id,
                end_id = commitment.end_id,
                observed = observed.len(),
                "refusing to sign commitment over events not locally observed"
            );
            return Err(BridgeError::ProofInvalid(
                "commitment range not observed locally".into(),
            ));
        }
        let local_root = MerkleTree::from_leaves(
            observed
                .iter()
                .map(arbor_bridge_types::StateSyncEvent::leaf_hash)
                .collect(),
        )
        .root();
        if local_root != commitment.root {
            return Err(BridgeError::ProofInvalid(
                "commitment root differs from locally derived root".into(),
            ));
        }
        Ok(())
    }

    /// Recomputes the exit event root and block hash for the checkpointed
    /// range from this node's own view of the child chain.
    async fn verify_checkpoint(
        &self,
        checkpoint: &arbor_bridge_types::Checkpoint,
    ) -> BridgeResult<()> {
        let local_hash = self.child_client.block_hash(checkpoint.end_block).await?;
        if local_hash != checkpoint.block_hash {
            return Err(BridgeError::ProofInvalid(
                "checkpoint block hash differs from local chain".into(),
            ));
        }

        let mut exits: Vec<ExitEvent> = self
            .child_client
            .query_exit_events(checkpoint.start_block, checkpoint.end_block)
            .await?
            .into_iter()
            .map(|(_, event)| event)
            .collect();
        exits.sort_by_key(|e| e.id);
        let local_root =
            MerkleTree::from_leaves(exits.iter().map(ExitEvent::leaf_hash).collect()).root();
        if local_root != checkpoint.event_root {
            return Err(BridgeError::ProofInvalid(
                "checkpoint event root differs from locally derived root".into(),
            ));
        }
        Ok(())
    }
}

/// In-process transport: exposes a handler as a `ValidatorClient`.
pub struct LocalValidatorClient {
    handler: Arc<SigningRequestHandler>,
}

impl LocalValidatorClient {
    pub fn new(handler: Arc<SigningRequestHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ValidatorClient for LocalValidatorClient {
    async fn request_signature(&self, request: SigningRequest) -> BridgeResult<Signature> {
        self.handler.handle_sign_request(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_client::{MockChildChain, MockRootChain};
    use crate::test_utils::{test_keys, test_metrics};
    use arbor_bridge_types::{Address, Checkpoint, Commitment, Hash};

    fn handler_with_chains() -> (Arc<MockRootChain>, Arc<MockChildChain>, SigningRequestHandler) {
        let root = Arc::new(MockRootChain::new());
        let child = Arc::new(MockChildChain::new());
        let handler = SigningRequestHandler::new(
            test_keys(1).remove(0),
            root.clone(),
            child.clone(),
            test_metrics(),
        );
        (root, child, handler)
    }

    fn emit_events(root: &MockRootChain, n: u64) {
        for i in 0..n {
            root.emit_state_sync(
                Address::repeat_byte(0xaa),
                Address::repeat_byte(0xcc),
                i.to_be_bytes().to_vec(),
            );
        }
    }

    #[tokio::test]
    async fn test_signs_commitment_matching_local_view() {
        let (root, _child, handler) = handler_with_chains();
        emit_events(&root, 5);
        let events = root.query_state_sync_events(0, 10).await.unwrap();
        let (commitment, _) = Commitment::over(&events).unwrap();

        let signature = handler
            .handle_sign_request(&SigningRequest::Commitment(commitment))
            .await
            .unwrap();
        let recovered =
            arbor_bridge_types::crypto::recover_signer(commitment.digest(), &signature).unwrap();
        assert_eq!(recovered, ethers::signers::Signer::address(&test_keys(1)[0]));
    }

    #[tokio::test]
    async fn test_refuses_commitment_over_unobserved_events() {
        let (root, _child, handler) = handler_with_chains();
        emit_events(&root, 3);
        // Claims ids 1..=5 but only 1..=3 exist locally.
        let commitment = Commitment {
            start_id: 1,
            end_id: 5,
            root: Hash::repeat_byte(1),
        };
        assert!(matches!(
            handler
                .handle_sign_request(&SigningRequest::Commitment(commitment))
                .await,
            Err(BridgeError::ProofInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_refuses_commitment_with_forged_root() {
        let (root, _child, handler) = handler_with_chains();
        emit_events(&root, 3);
        let events = root.query_state_sync_events(0, 10).await.unwrap();
        let (mut commitment, _) = Commitment::over(&events).unwrap();
        commitment.root = Hash::repeat_byte(0x66);
        assert!(matches!(
            handler
                .handle_sign_request(&SigningRequest::Commitment(commitment))
                .await,
            Err(BridgeError::ProofInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_signs_checkpoint_matching_local_view() {
        let (_root, child, handler) = handler_with_chains();
        child.advance_to_block(10);
        child.emit_exit_event(
            5,
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            vec![1],
        );
        let exits: Vec<_> = child
            .query_exit_events(1, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        let event_root =
            MerkleTree::from_leaves(exits.iter().map(ExitEvent::leaf_hash).collect()).root();
        let checkpoint = Checkpoint {
            epoch: 1,
            start_block: 1,
            end_block: 10,
            event_root,
            block_hash: child.block_hash(10).await.unwrap(),
        };
        handler
            .handle_sign_request(&SigningRequest::Checkpoint(checkpoint))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refuses_checkpoint_with_wrong_block_hash() {
        let (_root, child, handler) = handler_with_chains();
        child.advance_to_block(10);
        let checkpoint = Checkpoint {
            epoch: 1,
            start_block: 1,
            end_block: 10,
            event_root: Hash::zero(),
            block_hash: Hash::repeat_byte(0x12),
        };
        assert!(matches!(
            handler
                .handle_sign_request(&SigningRequest::Checkpoint(checkpoint))
                .await,
            Err(BridgeError::ProofInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_requests_hit_cache() {
        let (root, _child, handler) = handler_with_chains();
        emit_events(&root, 2);
        let events = root.query_state_sync_events(0, 10).await.unwrap();
        let (commitment, _) = Commitment::over(&events).unwrap();
        let request = SigningRequest::Commitment(commitment);

        let first = handler.handle_sign_request(&request).await.unwrap();
        let second = handler.handle_sign_request(&request).await.unwrap();
        assert_eq!(first, second);
    }
}
