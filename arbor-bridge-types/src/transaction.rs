//! Canonical binary encoding, decoding and hashing of the two transaction
//! kinds the bridge deals in: ordinary value transfers and zero-fee state
//! transactions carrying bridge payloads.

use crate::{Address, Hash};
use ethers::types::U256;
use ethers::utils::keccak256;
use ethers::utils::rlp::{DecoderError, Rlp, RlpStream};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use once_cell::sync::OnceCell;
use thiserror::Error;

/// Fixed gas allowance substituted for state transactions with no explicit
/// limit. State transactions are exempt from fee-market pricing.
pub const STATE_TRANSACTION_GAS_LIMIT: u64 = 1_000_000;

/// Number of RLP fields in the canonical layout.
const TX_FIELD_COUNT: usize = 9;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    strum_macros::Display,
)]
#[repr(u8)]
pub enum TxKind {
    Legacy = 0x00,
    State = 0x7f,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown transaction type: {0:#04x}")]
    UnknownTxType(u8),
    #[error("empty transaction payload")]
    Empty,
    #[error("malformed transaction rlp: {0}")]
    Rlp(#[from] DecoderError),
    #[error("expected {expected} transaction fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("malformed call data: {0}")]
    Abi(String),
}

/// A transaction in its canonical form. `hash` and `size` are expensive to
/// derive, so both are memoized in write-once cells on first access; a
/// transaction with different field values must be rebuilt through the
/// constructors, which start with empty cells.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    /// `None` means contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub input: Vec<u8>,
    pub v: U256,
    pub r: U256,
    pub s: U256,
    pub kind: TxKind,
    hash: OnceCell<Hash>,
    size: OnceCell<u64>,
}

impl Default for TxKind {
    fn default() -> Self {
        TxKind::Legacy
    }
}

// Cache cells are derived state and do not participate in equality.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.nonce == other.nonce
            && self.gas_price == other.gas_price
            && self.gas == other.gas
            && self.to == other.to
            && self.value == other.value
            && self.input == other.input
            && self.v == other.v
            && self.r == other.r
            && self.s == other.s
            && self.kind == other.kind
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn legacy(
        nonce: u64,
        gas_price: U256,
        gas: u64,
        to: Option<Address>,
        value: U256,
        input: Vec<u8>,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            to,
            value,
            input,
            kind: TxKind::Legacy,
            ..Default::default()
        }
    }

    /// A zero-fee state transaction carrying a bridge payload. The fixed gas
    /// allowance is substituted when no explicit limit is given.
    pub fn state(nonce: u64, to: Address, input: Vec<u8>) -> Self {
        Self {
            nonce,
            to: Some(to),
            input,
            gas: STATE_TRANSACTION_GAS_LIMIT,
            kind: TxKind::State,
            ..Default::default()
        }
    }

    /// Rebuilds the transaction with a signature attached. Memoized hash and
    /// size are reset since the canonical encoding changes.
    pub fn with_signature(mut self, v: U256, r: U256, s: U256) -> Self {
        self.v = v;
        self.r = r;
        self.s = s;
        self.hash = OnceCell::new();
        self.size = OnceCell::new();
        self
    }

    /// Canonical encoding: a one-byte type discriminator followed by the
    /// RLP list of the classical nine fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        s.begin_list(TX_FIELD_COUNT);
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        match &self.to {
            Some(to) => s.append(to),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.input);
        s.append(&self.v);
        s.append(&self.r);
        s.append(&self.s);
        let payload = s.out();

        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(self.kind.into());
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (kind_byte, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let kind =
            TxKind::try_from(*kind_byte).map_err(|_| DecodeError::UnknownTxType(*kind_byte))?;

        let rlp = Rlp::new(payload);
        let got = rlp.item_count()?;
        if got != TX_FIELD_COUNT {
            return Err(DecodeError::FieldCount {
                expected: TX_FIELD_COUNT,
                got,
            });
        }

        let to_item = rlp.at(3)?;
        let to = if to_item.is_empty() {
            None
        } else {
            Some(to_item.as_val()?)
        };

        let mut tx = Self {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            input: rlp.val_at(5)?,
            v: rlp.val_at(6)?,
            r: rlp.val_at(7)?,
            s: rlp.val_at(8)?,
            kind,
            hash: OnceCell::new(),
            size: OnceCell::new(),
        };
        if tx.kind == TxKind::State && tx.gas == 0 {
            tx.gas = STATE_TRANSACTION_GAS_LIMIT;
        }
        Ok(tx)
    }

    /// Keccak digest of the canonical encoding, computed once.
    pub fn hash(&self) -> Hash {
        *self
            .hash
            .get_or_init(|| Hash::from(keccak256(self.encode())))
    }

    /// Encoded length in bytes, computed once.
    pub fn size(&self) -> u64 {
        *self.size.get_or_init(|| self.encode().len() as u64)
    }

    /// `gas * gas_price + value`, saturating.
    pub fn cost(&self) -> U256 {
        self.gas_price
            .saturating_mul(U256::from(self.gas))
            .saturating_add(self.value)
    }

    /// State transactions are price-exempt; they are never underpriced.
    pub fn is_underpriced(&self, price_floor: u64) -> bool {
        self.kind != TxKind::State && self.gas_price < U256::from(price_floor)
    }

    pub fn exceeds_block_gas_limit(&self, block_gas_limit: u64) -> bool {
        self.gas > block_gas_limit
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}
