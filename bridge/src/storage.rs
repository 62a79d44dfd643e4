//! Persistent node state: event cursors, the executed-state-sync watermark,
//! delivered commitments, collected checkpoint signatures and finalized
//! checkpoints. Backed by sled trees with bincode-serialized values so
//! restarts resume exclusively after the last processed position and
//! signature collection never loses progress.

use crate::error::{BridgeError, BridgeResult};
use arbor_bridge_types::{Address, Checkpoint, ExitEvent, SignedCheckpoint, SignedCommitment};
use ethers::types::Signature;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const ROOT_CURSORS: &str = "root_event_cursors";
const CHILD_CURSOR: &str = "child_event_cursor";
const STATE_SYNC: &str = "state_sync";
const COMMITMENTS: &str = "commitments";
const COMMITMENT_SIGS: &str = "commitment_signatures";
const CHECKPOINT_SIGS: &str = "checkpoint_signatures";
const CHECKPOINTS: &str = "finalized_checkpoints";
const SEALED: &str = "sealed_checkpoints";
const EXITS: &str = "processed_exits";

const CHILD_CURSOR_KEY: &[u8] = b"cursor";
const LAST_EXECUTED_KEY: &[u8] = b"last_executed";
const LAST_FINALIZED_KEY: &[u8] = b"last_finalized_epoch";

pub struct BridgeOrchestratorStore {
    root_cursors: sled::Tree,
    child_cursor: sled::Tree,
    state_sync: sled::Tree,
    commitments: sled::Tree,
    commitment_sigs: sled::Tree,
    checkpoint_sigs: sled::Tree,
    checkpoints: sled::Tree,
    sealed: sled::Tree,
    exits: sled::Tree,
}

fn put<V: Serialize>(tree: &sled::Tree, key: impl AsRef<[u8]>, value: &V) -> BridgeResult<()> {
    tree.insert(key.as_ref(), bincode::serialize(value)?)?;
    Ok(())
}

fn get<V: DeserializeOwned>(tree: &sled::Tree, key: impl AsRef<[u8]>) -> BridgeResult<Option<V>> {
    tree.get(key.as_ref())?
        .map(|bytes| bincode::deserialize(&bytes).map_err(BridgeError::from))
        .transpose()
}

impl BridgeOrchestratorStore {
    pub fn new(path: &Path) -> BridgeResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            root_cursors: db.open_tree(ROOT_CURSORS)?,
            child_cursor: db.open_tree(CHILD_CURSOR)?,
            state_sync: db.open_tree(STATE_SYNC)?,
            commitments: db.open_tree(COMMITMENTS)?,
            commitment_sigs: db.open_tree(COMMITMENT_SIGS)?,
            checkpoint_sigs: db.open_tree(CHECKPOINT_SIGS)?,
            checkpoints: db.open_tree(CHECKPOINTS)?,
            sealed: db.open_tree(SEALED)?,
            exits: db.open_tree(EXITS)?,
        })
    }

    // ---- syncer cursors ----

    /// Last fully processed state-sync id per watched root contract.
    pub fn update_root_event_cursor(&self, contract: Address, last_id: u64) -> BridgeResult<()> {
        put(&self.root_cursors, contract.as_bytes(), &last_id)
    }

    pub fn get_root_event_cursors(
        &self,
        contracts: &[Address],
    ) -> BridgeResult<Vec<Option<u64>>> {
        contracts
            .iter()
            .map(|contract| get(&self.root_cursors, contract.as_bytes()))
            .collect()
    }

    /// Last fully processed child block.
    pub fn update_child_event_cursor(&self, block: u64) -> BridgeResult<()> {
        put(&self.child_cursor, CHILD_CURSOR_KEY, &block)
    }

    pub fn get_child_event_cursor(&self) -> BridgeResult<Option<u64>> {
        get(&self.child_cursor, CHILD_CURSOR_KEY)
    }

    // ---- state sync execution watermark ----

    pub fn set_last_executed_state_sync(&self, id: u64) -> BridgeResult<()> {
        put(&self.state_sync, LAST_EXECUTED_KEY, &id)
    }

    pub fn get_last_executed_state_sync(&self) -> BridgeResult<u64> {
        Ok(get(&self.state_sync, LAST_EXECUTED_KEY)?.unwrap_or(0))
    }

    // ---- commitments ----

    pub fn insert_commitment(&self, commitment: &SignedCommitment) -> BridgeResult<()> {
        put(
            &self.commitments,
            commitment.commitment.start_id.to_be_bytes(),
            commitment,
        )
    }

    pub fn get_commitments(&self) -> BridgeResult<Vec<SignedCommitment>> {
        self.commitments
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                bincode::deserialize(&bytes).map_err(BridgeError::from)
            })
            .collect()
    }

    /// The commitment with the highest start id, if any.
    pub fn get_last_commitment(&self) -> BridgeResult<Option<SignedCommitment>> {
        self.commitments
            .last()?
            .map(|(_, bytes)| bincode::deserialize(&bytes).map_err(BridgeError::from))
            .transpose()
    }

    // ---- collected signatures (re-offered on restart, never discarded) ----

    pub fn upsert_commitment_signature(
        &self,
        start_id: u64,
        signer: Address,
        signature: &Signature,
    ) -> BridgeResult<()> {
        let mut collected: BTreeMap<Address, Signature> =
            get(&self.commitment_sigs, start_id.to_be_bytes())?.unwrap_or_default();
        collected.insert(signer, *signature);
        put(&self.commitment_sigs, start_id.to_be_bytes(), &collected)
    }

    pub fn get_commitment_signatures(
        &self,
        start_id: u64,
    ) -> BridgeResult<BTreeMap<Address, Signature>> {
        Ok(get(&self.commitment_sigs, start_id.to_be_bytes())?.unwrap_or_default())
    }

    pub fn upsert_checkpoint_signature(
        &self,
        epoch: u64,
        signer: Address,
        signature: &Signature,
    ) -> BridgeResult<()> {
        let mut collected: BTreeMap<Address, Signature> =
            get(&self.checkpoint_sigs, epoch.to_be_bytes())?.unwrap_or_default();
        collected.insert(signer, *signature);
        put(&self.checkpoint_sigs, epoch.to_be_bytes(), &collected)
    }

    pub fn get_checkpoint_signatures(
        &self,
        epoch: u64,
    ) -> BridgeResult<BTreeMap<Address, Signature>> {
        Ok(get(&self.checkpoint_sigs, epoch.to_be_bytes())?.unwrap_or_default())
    }

    // ---- finalized checkpoints ----

    pub fn insert_finalized_checkpoint(&self, checkpoint: &SignedCheckpoint) -> BridgeResult<()> {
        let epoch = checkpoint.checkpoint.epoch;
        put(&self.checkpoints, epoch.to_be_bytes(), checkpoint)?;
        put(&self.checkpoints, LAST_FINALIZED_KEY, &epoch)
    }

    pub fn get_finalized_checkpoint(&self, epoch: u64) -> BridgeResult<Option<SignedCheckpoint>> {
        get(&self.checkpoints, epoch.to_be_bytes())
    }

    pub fn last_finalized_epoch(&self) -> BridgeResult<u64> {
        Ok(get(&self.checkpoints, LAST_FINALIZED_KEY)?.unwrap_or(0))
    }

    // ---- sealed-but-unfinalized checkpoints (resumed after restart) ----

    pub fn insert_sealed_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        exit_events: &[ExitEvent],
    ) -> BridgeResult<()> {
        put(
            &self.sealed,
            checkpoint.epoch.to_be_bytes(),
            &(*checkpoint, exit_events.to_vec()),
        )
    }

    pub fn remove_sealed_checkpoint(&self, epoch: u64) -> BridgeResult<()> {
        self.sealed.remove(epoch.to_be_bytes())?;
        Ok(())
    }

    /// Sealed checkpoints in epoch order.
    pub fn get_sealed_checkpoints(&self) -> BridgeResult<Vec<(Checkpoint, Vec<ExitEvent>)>> {
        self.sealed
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                bincode::deserialize(&bytes).map_err(BridgeError::from)
            })
            .collect()
    }

    // ---- exit replay protection ----

    /// Marks an exit id processed. Returns false when it already was, so the
    /// caller can report the benign replay.
    pub fn mark_exit_processed(&self, id: u64) -> BridgeResult<bool> {
        let fresh = self
            .exits
            .insert(id.to_be_bytes(), &[1u8][..])?
            .is_none();
        Ok(fresh)
    }

    pub fn is_exit_processed(&self, id: u64) -> BridgeResult<bool> {
        Ok(self.exits.get(id.to_be_bytes())?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_bridge_types::{Checkpoint, Commitment, Hash};

    fn store() -> (tempfile::TempDir, BridgeOrchestratorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BridgeOrchestratorStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_root_cursors() {
        let (_dir, store) = store();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        assert_eq!(store.get_root_event_cursors(&[a, b]).unwrap(), vec![None, None]);

        store.update_root_event_cursor(a, 41).unwrap();
        assert_eq!(
            store.get_root_event_cursors(&[a, b]).unwrap(),
            vec![Some(41), None]
        );
    }

    #[test]
    fn test_state_sync_watermark_defaults_to_zero() {
        let (_dir, store) = store();
        assert_eq!(store.get_last_executed_state_sync().unwrap(), 0);
        store.set_last_executed_state_sync(3).unwrap();
        assert_eq!(store.get_last_executed_state_sync().unwrap(), 3);
    }

    #[test]
    fn test_commitments_ordered_by_start_id() {
        let (_dir, store) = store();
        for start in [1u64, 6, 11] {
            let signed = SignedCommitment::new(
                Commitment {
                    start_id: start,
                    end_id: start + 4,
                    root: Hash::repeat_byte(start as u8),
                },
                BTreeMap::new(),
            );
            store.insert_commitment(&signed).unwrap();
        }
        let all = store.get_commitments().unwrap();
        assert_eq!(
            all.iter().map(|c| c.commitment.start_id).collect::<Vec<_>>(),
            vec![1, 6, 11]
        );
        assert_eq!(
            store.get_last_commitment().unwrap().unwrap().commitment.start_id,
            11
        );
    }

    #[test]
    fn test_checkpoint_signatures_accumulate() {
        let (_dir, store) = store();
        let signer = Address::repeat_byte(7);
        let signature = Signature {
            r: 1u64.into(),
            s: 2u64.into(),
            v: 27,
        };
        store
            .upsert_checkpoint_signature(4, signer, &signature)
            .unwrap();
        let collected = store.get_checkpoint_signatures(4).unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[&signer], signature);
        // Distinct epochs are independent.
        assert!(store.get_checkpoint_signatures(5).unwrap().is_empty());
    }

    #[test]
    fn test_finalized_checkpoints() {
        let (_dir, store) = store();
        assert_eq!(store.last_finalized_epoch().unwrap(), 0);
        let signed = SignedCheckpoint::new(
            Checkpoint {
                epoch: 2,
                start_block: 11,
                end_block: 20,
                event_root: Hash::repeat_byte(1),
                block_hash: Hash::repeat_byte(2),
            },
            BTreeMap::new(),
        );
        store.insert_finalized_checkpoint(&signed).unwrap();
        assert_eq!(store.last_finalized_epoch().unwrap(), 2);
        assert_eq!(store.get_finalized_checkpoint(2).unwrap(), Some(signed));
        assert_eq!(store.get_finalized_checkpoint(3).unwrap(), None);
    }

    #[test]
    fn test_exit_marking_is_exactly_once() {
        let (_dir, store) = store();
        assert!(!store.is_exit_processed(9).unwrap());
        assert!(store.mark_exit_processed(9).unwrap());
        assert!(!store.mark_exit_processed(9).unwrap());
        assert!(store.is_exit_processed(9).unwrap());
    }
}
