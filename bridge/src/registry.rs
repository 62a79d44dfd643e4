//! Validator/epoch registry. The current epoch is an immutable snapshot
//! behind an `ArcSwap`: many tasks read it, exactly one (the orchestrator)
//! replaces it wholesale at epoch boundaries. Stake and whitelist events only
//! touch pending deltas so signature verification for in-flight artifacts
//! stays stable mid-epoch.

use crate::metrics::BridgeMetrics;
use arbor_bridge_types::{Address, Epoch, Validator, ValidatorSetEvent};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct PendingChanges {
    whitelisted: BTreeMap<Address, Vec<u8>>,
    staked: BTreeMap<Address, u64>,
    unstaked: BTreeMap<Address, u64>,
}

pub struct ValidatorRegistry {
    current: ArcSwap<Epoch>,
    history: RwLock<BTreeMap<u64, Arc<Epoch>>>,
    pending: Mutex<PendingChanges>,
    metrics: Arc<BridgeMetrics>,
}

impl ValidatorRegistry {
    pub fn new(genesis: Epoch, metrics: Arc<BridgeMetrics>) -> Self {
        let genesis = Arc::new(genesis);
        let mut history = BTreeMap::new();
        history.insert(genesis.number, genesis.clone());
        let registry = Self {
            current: ArcSwap::from(genesis),
            history: RwLock::new(history),
            pending: Mutex::new(PendingChanges::default()),
            metrics,
        };
        registry.publish_voting_rights();
        registry
    }

    /// The active epoch snapshot. Holders keep seeing the same set even
    /// across an `advance_epoch`.
    pub fn current_epoch(&self) -> Arc<Epoch> {
        self.current.load_full()
    }

    /// A historical (or the current) epoch, for verifying signatures on
    /// artifacts signed in the past.
    pub fn epoch(&self, number: u64) -> Option<Arc<Epoch>> {
        self.history.read().get(&number).cloned()
    }

    pub fn voting_power_of(&self, epoch: u64, address: &Address) -> u64 {
        self.epoch(epoch)
            .map(|e| e.voting_power_of(address))
            .unwrap_or(0)
    }

    pub fn total_voting_power(&self, epoch: u64) -> u64 {
        self.epoch(epoch)
            .map(|e| e.total_voting_power())
            .unwrap_or(0)
    }

    pub fn quorum_met<'a>(
        &self,
        epoch: u64,
        signers: impl IntoIterator<Item = &'a Address>,
    ) -> bool {
        self.epoch(epoch)
            .map(|e| e.quorum_met(signers))
            .unwrap_or(false)
    }

    /// Records a validator-set event against pending state. Nothing changes
    /// for the active epoch.
    pub fn observe_event(&self, event: ValidatorSetEvent) {
        let mut pending = self.pending.lock();
        match event {
            ValidatorSetEvent::AddedToWhitelist { validator } => {
                pending.whitelisted.entry(validator).or_default();
            }
            ValidatorSetEvent::NewValidator {
                validator,
                public_key,
            } => {
                pending.whitelisted.insert(validator, public_key);
            }
            ValidatorSetEvent::Staked { validator, amount } => {
                *pending.staked.entry(validator).or_insert(0) += amount;
            }
            ValidatorSetEvent::Unstaked { validator, amount } => {
                *pending.unstaked.entry(validator).or_insert(0) += amount;
            }
        }
    }

    /// The validator set the next epoch would start with: the current set
    /// with pending stake applied and pending whitelisted validators added.
    /// Validators whose power drops to zero become inactive.
    pub fn next_validator_set(&self) -> Vec<Validator> {
        let current = self.current_epoch();
        let pending = self.pending.lock();

        let mut next: Vec<Validator> = current.validators.clone();
        for validator in next.iter_mut() {
            let staked = pending.staked.get(&validator.address).copied().unwrap_or(0);
            let unstaked = pending
                .unstaked
                .get(&validator.address)
                .copied()
                .unwrap_or(0);
            validator.voting_power = validator.voting_power.saturating_add(staked);
            validator.voting_power = validator.voting_power.saturating_sub(unstaked);
            validator.active = validator.voting_power > 0;
        }
        for (address, public_key) in pending.whitelisted.iter() {
            if next.iter().any(|v| &v.address == address) {
                continue;
            }
            let staked = pending.staked.get(address).copied().unwrap_or(0);
            if staked > 0 {
                next.push(Validator::new(*address, staked, public_key.clone()));
            }
        }
        next
    }

    /// Atomically replaces the active set. The outgoing epoch is sealed at
    /// `start_block - 1` and retained for historical verification; pending
    /// deltas consumed by the new set are dropped.
    pub fn advance_epoch(&self, new_set: Vec<Validator>, start_block: u64) -> Arc<Epoch> {
        let outgoing = self.current_epoch();
        let next = Arc::new(Epoch::new(outgoing.number + 1, new_set, start_block));

        {
            let mut history = self.history.write();
            history.insert(
                outgoing.number,
                Arc::new((*outgoing).clone().sealed(start_block)),
            );
            history.insert(next.number, next.clone());
        }
        *self.pending.lock() = PendingChanges::default();
        self.current.store(next.clone());
        self.publish_voting_rights();
        info!(
            epoch = next.number,
            start_block,
            validators = next.validators.len(),
            "advanced to new epoch"
        );
        next
    }

    fn publish_voting_rights(&self) {
        let epoch = self.current_epoch();
        for validator in &epoch.validators {
            self.metrics
                .current_voting_rights
                .with_label_values(&[&format!("{:#x}", validator.address)])
                .set(if validator.active {
                    validator.voting_power as i64
                } else {
                    0
                });
        }
    }
}
