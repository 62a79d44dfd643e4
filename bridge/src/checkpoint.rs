//! Checkpoint manager: per-epoch state machine
//! `Collecting → Signing → Submitted → Finalized`. One epoch collects while
//! earlier sealed epochs move through signing and submission strictly in
//! order; finalized epochs are immutable and a sealed payload is never
//! replaced. Sealed checkpoints and collected signatures persist so a restart
//! resumes signing instead of starting over.

use crate::error::{BridgeError, BridgeResult};
use crate::exit::ExitProofIndex;
use crate::metrics::BridgeMetrics;
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::{Address, Checkpoint, ExitEvent, Hash, SignedCheckpoint};
use ethers::types::Signature;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CheckpointPhase {
    Collecting,
    Signing,
    Submitted,
    Finalized,
}

/// A checkpoint sealed out of collection, moving toward finality.
#[derive(Debug, Clone)]
pub struct SealedCheckpoint {
    pub checkpoint: Checkpoint,
    pub signatures: BTreeMap<Address, Signature>,
    pub phase: CheckpointPhase,
}

struct Collecting {
    epoch: u64,
    start_block: u64,
    last_block: Option<(u64, Hash)>,
    exits: Vec<ExitEvent>,
}

pub struct CheckpointManager {
    store: Arc<BridgeOrchestratorStore>,
    exit_index: Arc<ExitProofIndex>,
    metrics: Arc<BridgeMetrics>,
    collecting: Mutex<Collecting>,
    /// Sealed checkpoints awaiting finality, in epoch order. Only the front
    /// is driven; checkpoints never skip an epoch.
    queue: Mutex<VecDeque<SealedCheckpoint>>,
}

impl CheckpointManager {
    /// Restores sealed checkpoints and their collected signatures from the
    /// store; collection resumes after the last sealed or finalized epoch.
    pub fn new(
        store: Arc<BridgeOrchestratorStore>,
        exit_index: Arc<ExitProofIndex>,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Self> {
        let last_finalized = store.last_finalized_epoch()?;
        let mut queue = VecDeque::new();
        let mut next_epoch = last_finalized + 1;
        let mut next_start = store
            .get_finalized_checkpoint(last_finalized)?
            .map(|c| c.checkpoint.end_block + 1)
            .unwrap_or(1);

        for (checkpoint, exits) in store.get_sealed_checkpoints()? {
            if checkpoint.epoch <= last_finalized {
                store.remove_sealed_checkpoint(checkpoint.epoch)?;
                continue;
            }
            let signatures = store.get_checkpoint_signatures(checkpoint.epoch)?;
            exit_index.index_epoch(checkpoint.epoch, exits);
            next_epoch = checkpoint.epoch + 1;
            next_start = checkpoint.end_block + 1;
            queue.push_back(SealedCheckpoint {
                checkpoint,
                signatures,
                phase: CheckpointPhase::Signing,
            });
        }
        if let Some(last) = queue.back() {
            info!(
                resumed = queue.len(),
                epoch = last.checkpoint.epoch,
                "resuming sealed checkpoints from storage"
            );
        }
        metrics.last_finalized_epoch.set(last_finalized as i64);

        Ok(Self {
            store,
            exit_index,
            metrics,
            collecting: Mutex::new(Collecting {
                epoch: next_epoch,
                start_block: next_start,
                last_block: None,
                exits: Vec::new(),
            }),
            queue: Mutex::new(queue),
        })
    }

    pub fn collecting_epoch(&self) -> u64 {
        self.collecting.lock().epoch
    }

    pub fn last_finalized_epoch(&self) -> BridgeResult<u64> {
        self.store.last_finalized_epoch()
    }

    pub fn observe_block(&self, number: u64, hash: Hash) {
        let mut collecting = self.collecting.lock();
        collecting.last_block = Some((number, hash));
    }

    pub fn observe_exit_event(&self, event: ExitEvent) {
        self.metrics.observed_exit_events.inc();
        self.collecting.lock().exits.push(event);
    }

    /// Seals the collecting epoch: indexes its exit events, builds the
    /// checkpoint over the observed block range, persists it and queues it
    /// for signing. Prior collected signatures are re-offered from storage.
    pub fn seal_epoch(&self) -> BridgeResult<Checkpoint> {
        let mut collecting = self.collecting.lock();
        let last_finalized = self.store.last_finalized_epoch()?;
        if collecting.epoch <= last_finalized {
            return Err(BridgeError::StaleCheckpoint {
                epoch: collecting.epoch,
                last_finalized,
            });
        }
        let (end_block, block_hash) = collecting.last_block.ok_or_else(|| {
            BridgeError::Internal(format!(
                "sealing epoch {} with no observed blocks",
                collecting.epoch
            ))
        })?;

        let mut exits = std::mem::take(&mut collecting.exits);
        exits.sort_by_key(|e| e.id);
        let exit_count = exits.len();
        let event_root = self.exit_index.index_epoch(collecting.epoch, exits.clone());

        let checkpoint = Checkpoint {
            epoch: collecting.epoch,
            start_block: collecting.start_block,
            end_block,
            event_root,
            block_hash,
        };
        self.store.insert_sealed_checkpoint(&checkpoint, &exits)?;
        let signatures = self.store.get_checkpoint_signatures(checkpoint.epoch)?;

        self.queue.lock().push_back(SealedCheckpoint {
            checkpoint,
            signatures,
            phase: CheckpointPhase::Signing,
        });
        self.metrics.sealed_checkpoints.inc();
        info!(
            epoch = checkpoint.epoch,
            start_block = checkpoint.start_block,
            end_block = checkpoint.end_block,
            exits = exit_count,
            "sealed checkpoint"
        );

        collecting.epoch += 1;
        collecting.start_block = end_block + 1;
        collecting.last_block = None;
        Ok(checkpoint)
    }

    /// The sealed checkpoint to drive next, if any.
    pub fn head(&self) -> Option<SealedCheckpoint> {
        self.queue.lock().front().cloned()
    }

    /// Merges newly collected signatures for the head epoch, persisting each
    /// so none are lost on shutdown.
    pub fn record_signatures(
        &self,
        epoch: u64,
        signatures: &BTreeMap<Address, Signature>,
    ) -> BridgeResult<()> {
        let mut queue = self.queue.lock();
        let head = queue.front_mut().ok_or_else(|| {
            BridgeError::Internal("recording signatures with no sealed checkpoint".into())
        })?;
        if head.checkpoint.epoch != epoch {
            return Err(BridgeError::Internal(format!(
                "signatures for epoch {epoch} but head is {}",
                head.checkpoint.epoch
            )));
        }
        for (signer, signature) in signatures {
            self.store
                .upsert_checkpoint_signature(epoch, *signer, signature)?;
            head.signatures.insert(*signer, *signature);
        }
        Ok(())
    }

    /// Marks the head checkpoint as submitted to the root chain.
    pub fn mark_submitted(&self, epoch: u64) -> BridgeResult<()> {
        let mut queue = self.queue.lock();
        match queue.front_mut() {
            Some(head) if head.checkpoint.epoch == epoch => {
                if head.phase == CheckpointPhase::Submitted {
                    self.metrics.checkpoint_resubmissions.inc();
                }
                head.phase = CheckpointPhase::Submitted;
                self.metrics.submitted_checkpoints.inc();
                Ok(())
            }
            _ => Err(BridgeError::Internal(format!(
                "epoch {epoch} is not the head checkpoint"
            ))),
        }
    }

    /// Root-chain reorganization dropped the submitted checkpoint: revert to
    /// signing with the identical payload. A finalized epoch is never
    /// re-signed.
    pub fn note_reorg(&self, epoch: u64) -> BridgeResult<()> {
        let last_finalized = self.store.last_finalized_epoch()?;
        if epoch <= last_finalized {
            return Err(BridgeError::StaleCheckpoint {
                epoch,
                last_finalized,
            });
        }
        let mut queue = self.queue.lock();
        match queue.front_mut() {
            Some(head) if head.checkpoint.epoch == epoch => {
                warn!(epoch, "reorg detected, reverting checkpoint to signing");
                head.phase = CheckpointPhase::Signing;
                self.metrics.checkpoint_resubmissions.inc();
                Ok(())
            }
            _ => Err(BridgeError::ReorgDetected(epoch)),
        }
    }

    /// The root chain accepted the head checkpoint: it becomes the proof
    /// root for exits in its epoch. Strictly monotonic; an epoch at or below
    /// the last finalized one is rejected.
    pub fn mark_finalized(&self, epoch: u64) -> BridgeResult<SignedCheckpoint> {
        let last_finalized = self.store.last_finalized_epoch()?;
        if epoch <= last_finalized {
            return Err(BridgeError::StaleCheckpoint {
                epoch,
                last_finalized,
            });
        }
        let mut queue = self.queue.lock();
        let head = queue.front().ok_or_else(|| {
            BridgeError::Internal("finalizing with no sealed checkpoint".into())
        })?;
        if head.checkpoint.epoch != epoch {
            return Err(BridgeError::Internal(format!(
                "epoch {epoch} is not the head checkpoint"
            )));
        }

        let signed = SignedCheckpoint::new(head.checkpoint, head.signatures.clone());
        self.store.insert_finalized_checkpoint(&signed)?;
        self.store.remove_sealed_checkpoint(epoch)?;
        queue.pop_front();
        self.metrics.last_finalized_epoch.set(epoch as i64);
        info!(epoch, "checkpoint finalized");
        Ok(signed)
    }
}
