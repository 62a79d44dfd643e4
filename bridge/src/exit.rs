//! Exit proof index and settlement. The index keeps, per checkpoint epoch, a
//! Merkle tree over the exit events observed in that epoch's block range and
//! serves membership proofs. Settlement replays-protects and verifies exits
//! against the finalized checkpoint's event root, marking the id processed
//! before any externally observable effect.

use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::{merkle, ExitEvent, MerkleProof, MerkleTree};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Processed,
    /// The id was already settled: a benign replay, not an error.
    AlreadyProcessed,
}

struct EpochExits {
    events: Vec<ExitEvent>,
    tree: MerkleTree,
}

/// Per-epoch Merkle trees over exit events, built when an epoch's checkpoint
/// is sealed.
#[derive(Default)]
pub struct ExitProofIndex {
    epochs: RwLock<BTreeMap<u64, EpochExits>>,
}

impl ExitProofIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes an epoch's exit events (ordered by id) and returns the tree
    /// root the checkpoint should carry.
    pub fn index_epoch(&self, epoch: u64, events: Vec<ExitEvent>) -> arbor_bridge_types::Hash {
        let tree = MerkleTree::from_leaves(events.iter().map(ExitEvent::leaf_hash).collect());
        let root = tree.root();
        self.epochs
            .write()
            .insert(epoch, EpochExits { events, tree });
        root
    }

    /// Membership proof for `event_id` within `epoch`, or `None` when either
    /// is unknown.
    pub fn proof_for(&self, epoch: u64, event_id: u64) -> Option<(ExitEvent, MerkleProof)> {
        let epochs = self.epochs.read();
        let exits = epochs.get(&epoch)?;
        let position = exits.events.iter().position(|e| e.id == event_id)?;
        let proof = exits.tree.proof(position)?;
        Some((exits.events[position].clone(), proof))
    }

    pub fn verify(
        root: arbor_bridge_types::Hash,
        event: &ExitEvent,
        proof: &MerkleProof,
    ) -> bool {
        merkle::verify(root, event.leaf_hash(), proof)
    }
}

/// Root-chain-facing exit settlement.
pub struct ExitSettlement {
    store: Arc<BridgeOrchestratorStore>,
    metrics: Arc<BridgeMetrics>,
}

impl ExitSettlement {
    pub fn new(store: Arc<BridgeOrchestratorStore>, metrics: Arc<BridgeMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Settles one exit against the finalized checkpoint for `epoch`.
    /// Exactly-once: the first valid call releases funds, every later call
    /// for the same id reports `AlreadyProcessed` regardless of the proof it
    /// carries.
    pub fn exit(
        &self,
        epoch: u64,
        event: &ExitEvent,
        proof: &MerkleProof,
    ) -> BridgeResult<ExitOutcome> {
        if self.store.is_exit_processed(event.id)? {
            self.metrics.rejected_exit_replays.inc();
            return Ok(ExitOutcome::AlreadyProcessed);
        }

        let checkpoint = self
            .store
            .get_finalized_checkpoint(epoch)?
            .ok_or_else(|| {
                BridgeError::ProofInvalid(format!("no finalized checkpoint for epoch {epoch}"))
            })?;
        if !ExitProofIndex::verify(checkpoint.checkpoint.event_root, event, proof) {
            return Err(BridgeError::ProofInvalid(format!(
                "exit {} does not prove against epoch {epoch} event root",
                event.id
            )));
        }

        // Mark before releasing anything so a reentrant or concurrent call
        // observes the processed flag first.
        if !self.store.mark_exit_processed(event.id)? {
            self.metrics.rejected_exit_replays.inc();
            return Ok(ExitOutcome::AlreadyProcessed);
        }
        self.metrics.processed_exits.inc();
        info!(
            id = event.id,
            receiver = ?event.receiver,
            epoch,
            "exit settled, funds released"
        );
        Ok(ExitOutcome::Processed)
    }
}
