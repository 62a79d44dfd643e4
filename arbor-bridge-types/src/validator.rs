//! Validator and epoch snapshots plus the quorum arithmetic evaluated over
//! them. An `Epoch` is immutable once constructed; the registry replaces the
//! whole snapshot at epoch boundaries instead of mutating it in place.

use crate::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub voting_power: u64,
    pub public_key: Vec<u8>,
    pub active: bool,
}

impl Validator {
    pub fn new(address: Address, voting_power: u64, public_key: Vec<u8>) -> Self {
        Self {
            address,
            voting_power,
            public_key,
            active: true,
        }
    }
}

/// A validator-set-stable period bounded by a start and (once the next epoch
/// begins) an end block. Ordered validator list; inactive members keep their
/// slot but contribute no voting power.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub number: u64,
    pub validators: Vec<Validator>,
    pub start_block: u64,
    /// `None` while the epoch is still open.
    pub end_block: Option<u64>,
}

impl Epoch {
    pub fn new(number: u64, validators: Vec<Validator>, start_block: u64) -> Self {
        Self {
            number,
            validators,
            start_block,
            end_block: None,
        }
    }

    pub fn validator(&self, address: &Address) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.address == address)
    }

    /// Voting power of `address`, zero when absent or inactive.
    pub fn voting_power_of(&self, address: &Address) -> u64 {
        self.validator(address)
            .filter(|v| v.active)
            .map(|v| v.voting_power)
            .unwrap_or(0)
    }

    pub fn total_voting_power(&self) -> u64 {
        self.validators
            .iter()
            .filter(|v| v.active)
            .map(|v| v.voting_power)
            .sum()
    }

    /// Combined voting power of the (deduplicated) signer set.
    pub fn signed_voting_power<'a>(&self, signers: impl IntoIterator<Item = &'a Address>) -> u64 {
        let unique: BTreeSet<&Address> = signers.into_iter().collect();
        unique.iter().map(|a| self.voting_power_of(a)).sum()
    }

    /// Strict supermajority: signer power must exceed two thirds of the
    /// total. Integer arithmetic only; exactly two thirds does not qualify.
    pub fn quorum_met<'a>(&self, signers: impl IntoIterator<Item = &'a Address>) -> bool {
        let signed = self.signed_voting_power(signers) as u128;
        let total = self.total_voting_power() as u128;
        signed * 3 > total * 2
    }

    /// Seals the epoch at the block preceding the next epoch's start.
    pub fn sealed(mut self, next_start_block: u64) -> Self {
        self.end_block = Some(next_start_block.saturating_sub(1));
        self
    }
}
