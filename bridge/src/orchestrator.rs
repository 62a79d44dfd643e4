//! The coordinating control loop. Drains both chain watchers into the
//! commitment builder and checkpoint collector, drives signature collection
//! and the two cross-chain submissions, and is the only component that
//! initiates transactions on either chain. Checkpoint submission is sequenced
//! behind commitment delivery so a checkpoint never references exit events
//! from a block range whose state syncs are not yet committed.

use crate::abi::{
    CommitEpochFn, CommitFn, DepositToFn, ExecuteFn, ExitFn, SubmitCheckpointFn, WithdrawToFn,
};
use crate::aggregator::SignatureAggregator;
use crate::checkpoint::{CheckpointManager, CheckpointPhase};
use crate::child_syncer::ChildChainUpdate;
use crate::client::{
    CheckpointStatus, ChildChainClient, RootChainClient, SerializedSubmitter, SigningRequest,
};
use crate::commitment::CommitmentBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::exit::{ExitOutcome, ExitProofIndex, ExitSettlement};
use crate::metrics::BridgeMetrics;
use crate::registry::ValidatorRegistry;
use crate::root_syncer::RootChainUpdate;
use crate::state_receiver::{ExecuteOutcome, StateReceiver};
use crate::storage::BridgeOrchestratorStore;
use arbor_bridge_types::{
    Address, Commitment, Hash, MerkleTree, SignedCommitment, StateSyncEvent, Transaction,
};
use arc_swap::ArcSwap;
use ethers::types::U256;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DRIVE_INTERVAL: Duration = Duration::from_millis(500);

pub struct OrchestratorParams {
    pub state_sender_address: Address,
    pub state_receiver_address: Address,
    pub child_erc20_predicate_address: Address,
    pub checkpoint_manager_address: Address,
    pub exit_helper_address: Address,
    pub root_erc20_predicate_address: Address,
    pub validator_set_address: Address,
    pub epoch_length: u64,
    pub signing_timeout: Duration,
    pub submission_retry: Duration,
    /// Drive rounds a blocked state-sync gap may persist before it is
    /// escalated to a fatal desynchronization.
    pub gap_alert_after: u32,
}

/// A batch whose commitment is built but not yet delivered with quorum.
struct PendingCommitment {
    commitment: Commitment,
    events: Vec<StateSyncEvent>,
    tree: MerkleTree,
}

struct LoopState {
    builder: CommitmentBuilder,
    pending: Option<PendingCommitment>,
    /// Events and trees for delivered commitments, kept to serve execute
    /// proofs; pruned once their range is fully executed.
    delivered: BTreeMap<u64, (Vec<StateSyncEvent>, MerkleTree)>,
    gap_stall_rounds: u32,
    last_checkpoint_submission: Option<Instant>,
}

pub struct BridgeOrchestrator {
    registry: Arc<ValidatorRegistry>,
    receiver: Arc<StateReceiver>,
    exit_index: Arc<ExitProofIndex>,
    settlement: Arc<ExitSettlement>,
    checkpoints: Arc<CheckpointManager>,
    aggregator: Arc<ArcSwap<SignatureAggregator>>,
    root_submitter: SerializedSubmitter<dyn RootChainClient>,
    child_submitter: SerializedSubmitter<dyn ChildChainClient>,
    store: Arc<BridgeOrchestratorStore>,
    metrics: Arc<BridgeMetrics>,
    params: OrchestratorParams,
    /// Address of this node's submission key; serializes its nonce slots.
    submission_key: Address,
    root_nonce: AtomicU64,
    child_nonce: AtomicU64,
    state: Mutex<LoopState>,
    cancel: CancellationToken,
}

impl BridgeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ValidatorRegistry>,
        receiver: Arc<StateReceiver>,
        exit_index: Arc<ExitProofIndex>,
        settlement: Arc<ExitSettlement>,
        checkpoints: Arc<CheckpointManager>,
        aggregator: Arc<ArcSwap<SignatureAggregator>>,
        root_client: Arc<dyn RootChainClient>,
        child_client: Arc<dyn ChildChainClient>,
        store: Arc<BridgeOrchestratorStore>,
        builder: CommitmentBuilder,
        params: OrchestratorParams,
        submission_key: Address,
        metrics: Arc<BridgeMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            receiver,
            exit_index,
            settlement,
            checkpoints,
            aggregator,
            root_submitter: SerializedSubmitter::new(root_client),
            child_submitter: SerializedSubmitter::new(child_client),
            store,
            metrics,
            params,
            submission_key,
            root_nonce: AtomicU64::new(0),
            child_nonce: AtomicU64::new(0),
            state: Mutex::new(LoopState {
                builder,
                pending: None,
                delivered: BTreeMap::new(),
                gap_stall_rounds: 0,
                last_checkpoint_submission: None,
            }),
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn receiver(&self) -> &Arc<StateReceiver> {
        &self.receiver
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub async fn run(
        self: Arc<Self>,
        root_rx: mpsc::Receiver<RootChainUpdate>,
        child_rx: mpsc::Receiver<ChildChainUpdate>,
    ) -> Vec<JoinHandle<()>> {
        let this = self.clone();
        vec![tokio::spawn(async move {
            this.run_inner(root_rx, child_rx).await;
        })]
    }

    async fn run_inner(
        &self,
        mut root_rx: mpsc::Receiver<RootChainUpdate>,
        mut child_rx: mpsc::Receiver<ChildChainUpdate>,
    ) {
        info!("bridge orchestrator started");
        let mut drive_interval = tokio::time::interval(DRIVE_INTERVAL);
        drive_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("bridge orchestrator shutting down");
                    return;
                }
                Some(update) = root_rx.recv() => self.handle_root_update(update).await,
                Some(update) = child_rx.recv() => self.handle_child_update(update).await,
                _ = drive_interval.tick() => {}
            }

            if let Err(err) = self.drive().await {
                if err.is_retryable() {
                    warn!("orchestrator round failed, will retry: {err}");
                } else {
                    error!("fatal orchestrator failure, halting: {err}");
                    self.metrics.errors.with_label_values(&["fatal"]).inc();
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn handle_root_update(&self, update: RootChainUpdate) {
        match update {
            RootChainUpdate::StateSync(events) => {
                let mut state = self.state.lock().await;
                for event in events {
                    state.builder.observe(event);
                }
            }
            RootChainUpdate::ValidatorSet(events) => {
                for event in events {
                    self.registry.observe_event(event);
                }
            }
        }
    }

    async fn handle_child_update(&self, update: ChildChainUpdate) {
        let mut exits_by_block: BTreeMap<u64, Vec<_>> = BTreeMap::new();
        for (block, event) in update.exits {
            exits_by_block.entry(block).or_default().push(event);
        }

        for (number, hash) in update.blocks {
            self.checkpoints.observe_block(number, hash);
            if let Some(events) = exits_by_block.remove(&number) {
                for event in events {
                    self.checkpoints.observe_exit_event(event);
                }
            }
            if number % self.params.epoch_length == 0 {
                self.turn_epoch(number).await;
            }
        }
    }

    /// Epoch boundary: seal the finished epoch's checkpoint, rotate the
    /// validator set and record the epoch on the validator-set contract.
    async fn turn_epoch(&self, end_block: u64) {
        match self.checkpoints.seal_epoch() {
            Ok(checkpoint) => {
                if let Err(err) = self.store.update_child_event_cursor(end_block) {
                    warn!("failed to persist child cursor at epoch seal: {err}");
                }
                let commit_epoch = CommitEpochFn {
                    epoch: checkpoint.epoch,
                    start_block: checkpoint.start_block,
                    end_block: checkpoint.end_block,
                };
                if let Err(err) = self
                    .submit_root_state_tx(self.params.validator_set_address, commit_epoch.encode_abi())
                    .await
                {
                    warn!(epoch = checkpoint.epoch, "commitEpoch submission failed: {err}");
                }
            }
            Err(err) => warn!(end_block, "failed to seal epoch: {err}"),
        }

        let next_set = self.registry.next_validator_set();
        self.registry.advance_epoch(next_set, end_block + 1);
    }

    /// One round of forward progress on commitments and checkpoints.
    async fn drive(&self) -> BridgeResult<()> {
        self.drive_commitment().await?;
        self.drive_checkpoint().await
    }

    async fn drive_commitment(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().await;

        if state.pending.is_none() {
            if let Some(events) = state.builder.ready_batch() {
                let (commitment, tree) =
                    Commitment::over(&events).ok_or_else(|| {
                        BridgeError::Internal("ready batch was empty".into())
                    })?;
                info!(
                    start_id = commitment.start_id,
                    end_id = commitment.end_id,
                    "built commitment batch"
                );
                state.pending = Some(PendingCommitment {
                    commitment,
                    events,
                    tree,
                });
                state.gap_stall_rounds = 0;
            } else if state.builder.blocking_gap().is_some() && state.builder.window_elapsed() {
                state.gap_stall_rounds += 1;
                if state.gap_stall_rounds >= self.params.gap_alert_after {
                    let (expected, got) = state.builder.blocking_gap().unwrap_or((0, 0));
                    error!(
                        expected,
                        got, "state sync stream desynchronized beyond the bounded wait"
                    );
                    self.metrics.errors.with_label_values(&["desync"]).inc();
                    return Err(BridgeError::Internal(format!(
                        "state sync desynchronized: expected {expected}, lowest buffered {got}"
                    )));
                }
            } else {
                state.gap_stall_rounds = 0;
            }
        }

        let Some(pending) = &state.pending else {
            return Ok(());
        };
        let commitment = pending.commitment;

        // Commitments are signed by the epoch active at build time.
        let epoch = self.registry.current_epoch();
        let prior = self.store.get_commitment_signatures(commitment.start_id)?;
        let outcome = self
            .aggregator
            .load_full()
            .collect(
                &epoch,
                SigningRequest::Commitment(commitment),
                prior,
                self.params.signing_timeout,
                &self.cancel,
            )
            .await;
        for (signer, signature) in &outcome.signatures {
            self.store
                .upsert_commitment_signature(commitment.start_id, *signer, signature)?;
        }
        if !outcome.quorum_met {
            return Err(BridgeError::QuorumNotMet {
                signed: epoch.signed_voting_power(outcome.signatures.keys()),
                total: epoch.total_voting_power(),
            });
        }

        let signed = SignedCommitment::new(commitment, outcome.signatures);
        self.metrics.built_commitments.inc();

        // Deliver to the child chain as a single state transaction, then
        // register locally and advance the durable cursor.
        let commit_call = CommitFn {
            start_id: commitment.start_id,
            end_id: commitment.end_id,
            root: commitment.root,
        };
        self.submit_child_state_tx(self.params.state_receiver_address, commit_call.encode_abi())
            .await?;
        self.receiver.commit(signed, &epoch)?;
        self.store
            .update_root_event_cursor(self.params.state_sender_address, commitment.end_id)?;

        let pending = state.pending.take().expect("checked above");
        state
            .delivered
            .insert(commitment.start_id, (pending.events, pending.tree));
        info!(
            start_id = commitment.start_id,
            end_id = commitment.end_id,
            "commitment delivered to child chain"
        );
        Ok(())
    }

    async fn drive_checkpoint(&self) -> BridgeResult<()> {
        let Some(head) = self.checkpoints.head() else {
            return Ok(());
        };

        // Sequencing: hold checkpoints while state-sync commitments for the
        // covered range are still in flight.
        {
            let state = self.state.lock().await;
            if state.pending.is_some() {
                return Ok(());
            }
        }

        let checkpoint = head.checkpoint;
        let epoch_snapshot = self
            .registry
            .epoch(checkpoint.epoch)
            .unwrap_or_else(|| self.registry.current_epoch());

        match head.phase {
            CheckpointPhase::Signing => {
                let outcome = self
                    .aggregator
                    .load_full()
                    .collect(
                        &epoch_snapshot,
                        SigningRequest::Checkpoint(checkpoint),
                        head.signatures,
                        self.params.signing_timeout,
                        &self.cancel,
                    )
                    .await;
                self.checkpoints
                    .record_signatures(checkpoint.epoch, &outcome.signatures)?;
                if !outcome.quorum_met {
                    return Err(BridgeError::QuorumNotMet {
                        signed: epoch_snapshot.signed_voting_power(outcome.signatures.keys()),
                        total: epoch_snapshot.total_voting_power(),
                    });
                }
                self.submit_checkpoint(&checkpoint).await?;
            }
            CheckpointPhase::Submitted => {
                match self
                    .root_submitter
                    .client()
                    .checkpoint_status(checkpoint.epoch, checkpoint.digest())
                    .await?
                {
                    CheckpointStatus::Accepted => {
                        self.checkpoints.mark_finalized(checkpoint.epoch)?;
                    }
                    CheckpointStatus::Reorged => {
                        self.checkpoints.note_reorg(checkpoint.epoch)?;
                    }
                    CheckpointStatus::Unknown => {
                        // Re-submit the identical payload once the retry
                        // window passes; acceptance is idempotent.
                        let due = {
                            let state = self.state.lock().await;
                            state
                                .last_checkpoint_submission
                                .map(|at| at.elapsed() >= self.params.submission_retry)
                                .unwrap_or(true)
                        };
                        if due {
                            self.metrics.checkpoint_resubmissions.inc();
                            self.submit_checkpoint(&checkpoint).await?;
                        }
                    }
                }
            }
            phase => {
                return Err(BridgeError::Internal(format!(
                    "sealed checkpoint in unexpected phase {phase}"
                )));
            }
        }
        Ok(())
    }

    async fn submit_checkpoint(
        &self,
        checkpoint: &arbor_bridge_types::Checkpoint,
    ) -> BridgeResult<()> {
        let call = SubmitCheckpointFn {
            epoch: checkpoint.epoch,
            start_block: checkpoint.start_block,
            end_block: checkpoint.end_block,
            event_root: checkpoint.event_root,
            block_hash: checkpoint.block_hash,
        };
        self.submit_root_state_tx(self.params.checkpoint_manager_address, call.encode_abi())
            .await?;
        self.checkpoints.mark_submitted(checkpoint.epoch)?;
        self.state.lock().await.last_checkpoint_submission = Some(Instant::now());
        info!(epoch = checkpoint.epoch, "checkpoint submitted to root chain");
        Ok(())
    }

    async fn submit_root_state_tx(&self, to: Address, input: Vec<u8>) -> BridgeResult<Hash> {
        let nonce = self.root_nonce.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction::state(nonce, to, input);
        self.root_submitter.submit(self.submission_key, tx).await
    }

    async fn submit_child_state_tx(&self, to: Address, input: Vec<u8>) -> BridgeResult<Hash> {
        let nonce = self.child_nonce.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction::state(nonce, to, input);
        self.child_submitter.submit(self.submission_key, tx).await
    }

    // ---- operations consumed by the external commands ----

    /// Deposits into the bridge on the root chain; the resulting state-sync
    /// event flows to the child chain through the commitment pipeline.
    pub async fn deposit(&self, receiver: Address, amount: U256) -> BridgeResult<Hash> {
        let call = DepositToFn { receiver, amount };
        self.submit_root_state_tx(self.params.root_erc20_predicate_address, call.encode_abi())
            .await
    }

    /// Withdraws on the child chain; the resulting exit event becomes
    /// provable once its epoch's checkpoint finalizes.
    pub async fn withdraw(&self, receiver: Address, amount: U256) -> BridgeResult<Hash> {
        let call = WithdrawToFn { receiver, amount };
        self.submit_child_state_tx(self.params.child_erc20_predicate_address, call.encode_abi())
            .await
    }

    /// Proves and settles an exit against its epoch's finalized checkpoint.
    pub async fn exit(&self, epoch: u64, event_id: u64) -> BridgeResult<ExitOutcome> {
        let (event, proof) = self.exit_index.proof_for(epoch, event_id).ok_or_else(|| {
            BridgeError::Generic(format!(
                "no exit proof for event {event_id} in epoch {epoch}"
            ))
        })?;
        self.metrics.served_exit_proofs.inc();
        let outcome = self.settlement.exit(epoch, &event, &proof)?;
        if outcome == ExitOutcome::Processed {
            let call = ExitFn {
                epoch,
                id: event_id,
                leaf: event.abi_encode(),
                proof,
            };
            self.submit_root_state_tx(self.params.exit_helper_address, call.encode_abi())
                .await?;
        }
        Ok(outcome)
    }

    /// Replays one committed state-sync event on the child chain. Retried
    /// and paid for by whoever benefits from the transfer.
    pub async fn execute_state_sync(&self, id: u64) -> BridgeResult<ExecuteOutcome> {
        let (event, proof) = {
            let state = self.state.lock().await;
            let (events, tree) = state
                .delivered
                .range(..=id)
                .next_back()
                .map(|(_, entry)| entry)
                .ok_or_else(|| {
                    BridgeError::Generic(format!("no delivered commitment covers id {id}"))
                })?;
            let position = events
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| {
                    BridgeError::Generic(format!("no delivered commitment covers id {id}"))
                })?;
            let proof = tree.proof(position).ok_or_else(|| {
                BridgeError::Internal("delivered tree misses a committed leaf".into())
            })?;
            (events[position].clone(), proof)
        };

        let outcome = self.receiver.execute(&event, &proof)?;
        if outcome == ExecuteOutcome::Executed {
            let call = ExecuteFn {
                id,
                proof,
                event_data: event.abi_encode(),
            };
            self.submit_child_state_tx(self.params.state_receiver_address, call.encode_abi())
                .await?;
            self.prune_executed().await;
        }
        Ok(outcome)
    }

    /// Drops delivered trees whose whole range has been executed.
    async fn prune_executed(&self) {
        let Ok(last_executed) = self.receiver.last_executed() else {
            return;
        };
        let mut state = self.state.lock().await;
        state
            .delivered
            .retain(|_, (events, _)| events.last().map(|e| e.id > last_executed).unwrap_or(false));
    }

    /// Shutdown accounting: buffered events are safe to drop because the
    /// durable cursor only advances at delivery, so the next start
    /// re-observes them; collected signatures are already persisted.
    pub async fn flush_on_shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(events) = state.builder.force_flush() {
            info!(
                count = events.len(),
                "dropping buffered state sync events; they will be re-observed on restart"
            );
        }
    }
}
