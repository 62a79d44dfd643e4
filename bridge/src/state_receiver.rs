//! Child-chain side of state sync: two-phase commit/execute delivery.
//! `commit` registers a quorum-verified Merkle root without side effects;
//! `execute` replays one event's payload, guarded by a persisted
//! monotonically increasing last-executed counter so each id applies exactly
//! once and never out of order.

use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::{merkle, Epoch, MerkleProof, SignedCommitment, StateSyncEvent};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Executed,
    /// The id was at or below the watermark: an idempotent replay.
    AlreadyExecuted,
}

pub struct StateReceiver {
    store: Arc<BridgeOrchestratorStore>,
    // Registered commitments keyed by start id.
    commitments: RwLock<BTreeMap<u64, SignedCommitment>>,
    metrics: Arc<BridgeMetrics>,
}

impl StateReceiver {
    /// Restores registered commitments and the executed watermark from the
    /// store.
    pub fn new(
        store: Arc<BridgeOrchestratorStore>,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Self> {
        let commitments = store
            .get_commitments()?
            .into_iter()
            .map(|c| (c.commitment.start_id, c))
            .collect();
        Ok(Self {
            store,
            commitments: RwLock::new(commitments),
            metrics,
        })
    }

    pub fn last_executed(&self) -> BridgeResult<u64> {
        self.store.get_last_executed_state_sync()
    }

    /// End id of the last registered commitment, zero when none.
    pub fn last_registered_end(&self) -> u64 {
        self.commitments
            .read()
            .values()
            .last()
            .map(|c| c.commitment.end_id)
            .unwrap_or(0)
    }

    /// Registers a commitment root. Verifies the signature quorum against the
    /// epoch it was signed in and that the range continues the previous
    /// commitment exactly; no payload is touched.
    pub fn commit(&self, signed: SignedCommitment, epoch: &Epoch) -> BridgeResult<()> {
        signed.verify(epoch)?;

        let expected = self.last_registered_end() + 1;
        let start = signed.commitment.start_id;
        if start != expected {
            return Err(BridgeError::Gap {
                expected,
                got: start,
            });
        }

        self.store.insert_commitment(&signed)?;
        info!(
            start_id = signed.commitment.start_id,
            end_id = signed.commitment.end_id,
            "registered state sync commitment"
        );
        self.commitments.write().insert(start, signed);
        self.metrics.delivered_commitments.inc();
        Ok(())
    }

    fn commitment_covering(&self, id: u64) -> Option<SignedCommitment> {
        self.commitments
            .read()
            .values()
            .find(|c| c.commitment.contains(id))
            .cloned()
    }

    /// Replays one event against its target. Ids at or below the watermark
    /// succeed as no-ops; ids that skip ahead are rejected; the Merkle proof
    /// must verify against the registered root covering the id.
    pub fn execute(
        &self,
        event: &StateSyncEvent,
        proof: &MerkleProof,
    ) -> BridgeResult<ExecuteOutcome> {
        let last = self.store.get_last_executed_state_sync()?;
        if event.id <= last {
            debug!(id = event.id, "state sync already executed, no-op");
            self.metrics.skipped_state_sync_replays.inc();
            return Ok(ExecuteOutcome::AlreadyExecuted);
        }
        if event.id != last + 1 {
            return Err(BridgeError::Gap {
                expected: last + 1,
                got: event.id,
            });
        }

        let signed = self.commitment_covering(event.id).ok_or_else(|| {
            BridgeError::ProofInvalid(format!("no registered commitment covers id {}", event.id))
        })?;
        let commitment = signed.commitment;
        if Some(proof.leaf_index) != commitment.leaf_index(event.id) {
            return Err(BridgeError::ProofInvalid(format!(
                "leaf index {} does not match id {} in range {}..={}",
                proof.leaf_index, event.id, commitment.start_id, commitment.end_id
            )));
        }
        if !merkle::verify(commitment.root, event.leaf_hash(), proof) {
            return Err(BridgeError::ProofInvalid(format!(
                "membership proof for id {} rejected",
                event.id
            )));
        }

        // Advance the watermark before reporting success so a replay of the
        // same id can never apply twice.
        self.store.set_last_executed_state_sync(event.id)?;
        self.metrics.executed_state_syncs.inc();
        info!(id = event.id, target = ?event.target, "executed state sync");
        Ok(ExecuteOutcome::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{state_sync_events, test_epoch, test_keys, test_metrics, test_store};
    use arbor_bridge_types::crypto::sign_digest;
    use arbor_bridge_types::{Commitment, MerkleTree};
    use ethers::signers::Signer;

    fn signed_over(
        events: &[StateSyncEvent],
        keys: &[arbor_bridge_types::crypto::AuthorityKeyPair],
    ) -> (SignedCommitment, MerkleTree) {
        let (commitment, tree) = Commitment::over(events).unwrap();
        let digest = commitment.digest();
        let signatures = keys
            .iter()
            .map(|k| (k.address(), sign_digest(k, digest).unwrap()))
            .collect();
        (SignedCommitment::new(commitment, signatures), tree)
    }

    fn setup() -> (
        tempfile::TempDir,
        StateReceiver,
        Epoch,
        Vec<arbor_bridge_types::crypto::AuthorityKeyPair>,
    ) {
        let (dir, store) = test_store();
        let receiver = StateReceiver::new(store, test_metrics()).unwrap();
        let keys = test_keys(3);
        let epoch = test_epoch(&keys, &[1, 1, 1]);
        (dir, receiver, epoch, keys)
    }

    #[test]
    fn test_commit_then_execute_in_order() {
        let (_dir, receiver, epoch, keys) = setup();
        let events = state_sync_events(1..=5);
        let (signed, tree) = signed_over(&events, &keys);
        receiver.commit(signed, &epoch).unwrap();

        for (i, event) in events.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert_eq!(
                receiver.execute(event, &proof).unwrap(),
                ExecuteOutcome::Executed
            );
        }
        assert_eq!(receiver.last_executed().unwrap(), 5);
    }

    #[test]
    fn test_execute_out_of_order_rejected() {
        let (_dir, receiver, epoch, keys) = setup();
        let events = state_sync_events(1..=5);
        let (signed, tree) = signed_over(&events, &keys);
        receiver.commit(signed, &epoch).unwrap();

        // Id 3 before 1 and 2: rejected.
        let proof = tree.proof(2).unwrap();
        assert!(matches!(
            receiver.execute(&events[2], &proof),
            Err(BridgeError::Gap {
                expected: 1,
                got: 3
            })
        ));

        // After 1 and 2, id 3 goes through.
        receiver.execute(&events[0], &tree.proof(0).unwrap()).unwrap();
        receiver.execute(&events[1], &tree.proof(1).unwrap()).unwrap();
        assert_eq!(
            receiver.execute(&events[2], &proof).unwrap(),
            ExecuteOutcome::Executed
        );
    }

    #[test]
    fn test_execute_is_idempotent() {
        let (_dir, receiver, epoch, keys) = setup();
        let events = state_sync_events(1..=2);
        let (signed, tree) = signed_over(&events, &keys);
        receiver.commit(signed, &epoch).unwrap();

        let proof = tree.proof(0).unwrap();
        assert_eq!(
            receiver.execute(&events[0], &proof).unwrap(),
            ExecuteOutcome::Executed
        );
        // Second call with the same id succeeds as a no-op.
        assert_eq!(
            receiver.execute(&events[0], &proof).unwrap(),
            ExecuteOutcome::AlreadyExecuted
        );
        assert_eq!(receiver.last_executed().unwrap(), 1);
    }

    #[test]
    fn test_execute_bad_proof_rejected() {
        let (_dir, receiver, epoch, keys) = setup();
        let events = state_sync_events(1..=4);
        let (signed, tree) = signed_over(&events, &keys);
        receiver.commit(signed, &epoch).unwrap();

        // Proof for a different leaf.
        let wrong = tree.proof(1).unwrap();
        assert!(matches!(
            receiver.execute(&events[0], &wrong),
            Err(BridgeError::ProofInvalid(_))
        ));
        // Nothing was applied.
        assert_eq!(receiver.last_executed().unwrap(), 0);
    }

    #[test]
    fn test_commit_gap_rejected() {
        let (_dir, receiver, epoch, keys) = setup();
        let (first, _) = signed_over(&state_sync_events(1..=5), &keys);
        receiver.commit(first, &epoch).unwrap();

        // 7 skips 6: gap.
        let (gapped, _) = signed_over(&state_sync_events(7..=9), &keys);
        assert!(matches!(
            receiver.commit(gapped, &epoch),
            Err(BridgeError::Gap {
                expected: 6,
                got: 7
            })
        ));

        let (next, _) = signed_over(&state_sync_events(6..=9), &keys);
        receiver.commit(next, &epoch).unwrap();
        assert_eq!(receiver.last_registered_end(), 9);
    }

    #[test]
    fn test_commit_without_quorum_rejected() {
        let (_dir, receiver, epoch, keys) = setup();
        // Only one of three unit-power validators signs.
        let (signed, _) = signed_over(&state_sync_events(1..=2), &keys[..1]);
        assert!(matches!(
            receiver.commit(signed, &epoch),
            Err(BridgeError::QuorumNotMet { .. })
        ));
    }

    #[test]
    fn test_restart_restores_commitments_and_watermark() {
        let (dir, store) = test_store();
        let keys = test_keys(3);
        let epoch = test_epoch(&keys, &[1, 1, 1]);
        let events = state_sync_events(1..=3);
        let (signed, tree) = signed_over(&events, &keys);
        {
            let receiver = StateReceiver::new(store.clone(), test_metrics()).unwrap();
            receiver.commit(signed, &epoch).unwrap();
            receiver.execute(&events[0], &tree.proof(0).unwrap()).unwrap();
        }
        // Fresh receiver over the same store: watermark and roots survive.
        let receiver = StateReceiver::new(store, test_metrics()).unwrap();
        assert_eq!(receiver.last_executed().unwrap(), 1);
        assert_eq!(receiver.last_registered_end(), 3);
        assert_eq!(
            receiver.execute(&events[0], &tree.proof(0).unwrap()).unwrap(),
            ExecuteOutcome::AlreadyExecuted
        );
        assert_eq!(
            receiver.execute(&events[1], &tree.proof(1).unwrap()).unwrap(),
            ExecuteOutcome::Executed
        );
        drop(dir);
    }
}
