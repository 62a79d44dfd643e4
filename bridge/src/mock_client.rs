//! In-memory chain and validator doubles. They model just enough of both
//! chains for the orchestrator to run end-to-end: submitted transactions are
//! decoded through the ABI capability table and produce the events a real
//! chain would emit.

use crate::abi::{DepositToFn, SubmitCheckpointFn, SyncStateFn, WithdrawToFn};
use crate::client::{
    CheckpointStatus, ChildChainClient, RootChainClient, SigningRequest, TransactionSubmitter,
    ValidatorClient,
};
use crate::error::{BridgeError, BridgeResult};
use arbor_bridge_types::crypto::{sign_digest, AuthorityKeyPair};
use arbor_bridge_types::{
    Address, ExitEvent, Hash, StateSyncEvent, Transaction, ValidatorSetEvent,
};
use async_trait::async_trait;
use ethers::types::Signature;
use ethers::utils::keccak256;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Default)]
struct RootInner {
    latest_block: u64,
    state_sync_events: Vec<StateSyncEvent>,
    validator_events: Vec<(u64, ValidatorSetEvent)>,
    submitted: Vec<Transaction>,
    accepted_checkpoints: HashMap<u64, Hash>,
    reorged_epochs: HashSet<u64>,
    fail_submissions: u32,
}

/// Root chain double. Deposit and sync-state submissions emit state-sync
/// events; checkpoint submissions are accepted immediately unless the epoch
/// is flagged as reorged.
#[derive(Default)]
pub struct MockRootChain {
    inner: Mutex<RootInner>,
    /// Target contract recorded on emitted state-sync events.
    pub child_predicate: Address,
}

impl MockRootChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RootInner::default()),
            child_predicate: Address::repeat_byte(0xcc),
        }
    }

    pub fn set_latest_block(&self, block: u64) {
        self.inner.lock().latest_block = block;
    }

    pub fn emit_state_sync(&self, source: Address, target: Address, data: Vec<u8>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.state_sync_events.last().map(|e| e.id).unwrap_or(0) + 1;
        inner.state_sync_events.push(StateSyncEvent {
            id,
            source,
            target,
            data,
        });
        id
    }

    pub fn emit_validator_event(&self, block: u64, event: ValidatorSetEvent) {
        self.inner.lock().validator_events.push((block, event));
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.inner.lock().fail_submissions = count;
    }

    pub fn set_reorged(&self, epoch: u64, reorged: bool) {
        let mut inner = self.inner.lock();
        if reorged {
            inner.reorged_epochs.insert(epoch);
            inner.accepted_checkpoints.remove(&epoch);
        } else {
            inner.reorged_epochs.remove(&epoch);
        }
    }

    pub fn accepted_checkpoint(&self, epoch: u64) -> Option<Hash> {
        self.inner.lock().accepted_checkpoints.get(&epoch).copied()
    }

    pub fn submitted_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().submitted.clone()
    }
}

#[async_trait]
impl TransactionSubmitter for MockRootChain {
    async fn submit_transaction(&self, tx: Transaction) -> BridgeResult<Hash> {
        let mut inner = self.inner.lock();
        if inner.fail_submissions > 0 {
            inner.fail_submissions -= 1;
            return Err(BridgeError::Submission(
                "root chain rejected transaction".into(),
            ));
        }
        let hash = tx.hash();
        let input = tx.input.clone();
        inner.submitted.push(tx);

        if input.len() >= 4 {
            let selector: [u8; 4] = input[..4].try_into().unwrap_or_default();
            if selector == SubmitCheckpointFn::sig() {
                if let Ok(call) = SubmitCheckpointFn::decode_abi(&input) {
                    if !inner.reorged_epochs.contains(&call.epoch) {
                        let digest = arbor_bridge_types::Checkpoint {
                            epoch: call.epoch,
                            start_block: call.start_block,
                            end_block: call.end_block,
                            event_root: call.event_root,
                            block_hash: call.block_hash,
                        }
                        .digest();
                        // Accepting the same payload twice is a no-op.
                        inner.accepted_checkpoints.entry(call.epoch).or_insert(digest);
                    }
                }
            } else if selector == DepositToFn::sig() || selector == SyncStateFn::sig() {
                let id = inner.state_sync_events.last().map(|e| e.id).unwrap_or(0) + 1;
                let target = self.child_predicate;
                inner.state_sync_events.push(StateSyncEvent {
                    id,
                    source: Address::repeat_byte(0xaa),
                    target,
                    data: input[4..].to_vec(),
                });
            }
        }
        Ok(hash)
    }
}

#[async_trait]
impl RootChainClient for MockRootChain {
    async fn latest_block(&self) -> BridgeResult<u64> {
        Ok(self.inner.lock().latest_block)
    }

    async fn query_state_sync_events(
        &self,
        after_id: u64,
        limit: usize,
    ) -> BridgeResult<Vec<StateSyncEvent>> {
        Ok(self
            .inner
            .lock()
            .state_sync_events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn query_validator_set_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<ValidatorSetEvent>> {
        Ok(self
            .inner
            .lock()
            .validator_events
            .iter()
            .filter(|(block, _)| (from_block..=to_block).contains(block))
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn checkpoint_status(&self, epoch: u64, digest: Hash) -> BridgeResult<CheckpointStatus> {
        let inner = self.inner.lock();
        if inner.reorged_epochs.contains(&epoch) {
            return Ok(CheckpointStatus::Reorged);
        }
        match inner.accepted_checkpoints.get(&epoch) {
            Some(accepted) if *accepted == digest => Ok(CheckpointStatus::Accepted),
            _ => Ok(CheckpointStatus::Unknown),
        }
    }
}

#[derive(Default)]
struct ChildInner {
    latest_block: u64,
    block_hashes: HashMap<u64, Hash>,
    exit_events: Vec<(u64, ExitEvent)>,
    submitted: Vec<Transaction>,
    fail_submissions: u32,
}

/// Child chain double. Withdraw submissions emit exit events at the current
/// head; block hashes are deterministic unless overridden.
#[derive(Default)]
pub struct MockChildChain {
    inner: Mutex<ChildInner>,
}

impl MockChildChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_to_block(&self, block: u64) {
        self.inner.lock().latest_block = block;
    }

    pub fn emit_exit_event(&self, block: u64, sender: Address, receiver: Address, data: Vec<u8>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.exit_events.last().map(|(_, e)| e.id).unwrap_or(0) + 1;
        inner.exit_events.push((
            block,
            ExitEvent {
                id,
                sender,
                receiver,
                data,
            },
        ));
        id
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.inner.lock().fail_submissions = count;
    }

    pub fn submitted_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().submitted.clone()
    }
}

#[async_trait]
impl TransactionSubmitter for MockChildChain {
    async fn submit_transaction(&self, tx: Transaction) -> BridgeResult<Hash> {
        let mut inner = self.inner.lock();
        if inner.fail_submissions > 0 {
            inner.fail_submissions -= 1;
            return Err(BridgeError::Submission(
                "child chain rejected transaction".into(),
            ));
        }
        let hash = tx.hash();
        let input = tx.input.clone();
        let sender = Address::repeat_byte(0xbb);
        let head = inner.latest_block;
        inner.submitted.push(tx);

        if input.len() >= 4 && input[..4] == WithdrawToFn::sig() {
            let id = inner.exit_events.last().map(|(_, e)| e.id).unwrap_or(0) + 1;
            inner.exit_events.push((
                head,
                ExitEvent {
                    id,
                    sender,
                    receiver: Address::repeat_byte(0xdd),
                    data: input[4..].to_vec(),
                },
            ));
        }
        Ok(hash)
    }
}

#[async_trait]
impl ChildChainClient for MockChildChain {
    async fn latest_block(&self) -> BridgeResult<u64> {
        Ok(self.inner.lock().latest_block)
    }

    async fn block_hash(&self, block: u64) -> BridgeResult<Hash> {
        Ok(self
            .inner
            .lock()
            .block_hashes
            .get(&block)
            .copied()
            .unwrap_or_else(|| Hash::from(keccak256(block.to_be_bytes()))))
    }

    async fn query_exit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<(u64, ExitEvent)>> {
        Ok(self
            .inner
            .lock()
            .exit_events
            .iter()
            .filter(|(block, _)| (from_block..=to_block).contains(block))
            .cloned()
            .collect())
    }
}

/// How a mock validator answers signing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorMode {
    Honest,
    /// Never answers within any reasonable timeout.
    Offline,
    /// Signs an unrelated digest.
    WrongDigest,
}

pub struct MockValidator {
    key: AuthorityKeyPair,
    mode: Mutex<ValidatorMode>,
}

impl MockValidator {
    pub fn new(key: AuthorityKeyPair) -> Self {
        Self {
            key,
            mode: Mutex::new(ValidatorMode::Honest),
        }
    }

    pub fn set_mode(&self, mode: ValidatorMode) {
        *self.mode.lock() = mode;
    }
}

#[async_trait]
impl ValidatorClient for MockValidator {
    async fn request_signature(&self, request: SigningRequest) -> BridgeResult<Signature> {
        let mode = *self.mode.lock();
        match mode {
            ValidatorMode::Honest => sign_digest(&self.key, request.digest())
                .map_err(|e| BridgeError::Signing(e.to_string())),
            ValidatorMode::Offline => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BridgeError::Signing("unreachable".into()))
            }
            ValidatorMode::WrongDigest => sign_digest(&self.key, Hash::repeat_byte(0xee))
                .map_err(|e| BridgeError::Signing(e.to_string())),
        }
    }
}
