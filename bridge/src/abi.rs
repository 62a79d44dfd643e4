//! Fixed table of contract call encoders for the root/child chain surface the
//! bridge drives. These mirror the output of the offline binding generator:
//! one struct per method with a `sig()` selector and `encode_abi`/`decode_abi`
//! pair. The runtime treats them as opaque capabilities and never derives new
//! ones.

use arbor_bridge_types::transaction::DecodeError;
use arbor_bridge_types::{Address, Hash, MerkleProof};
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::U256;
use ethers::utils::id;

fn selector(signature: &str) -> [u8; 4] {
    id(signature)
}

fn encode_call(sig: &str, tokens: &[Token]) -> Vec<u8> {
    let mut out = selector(sig).to_vec();
    out.extend_from_slice(&encode(tokens));
    out
}

fn decode_call(sig: &str, params: &[ParamType], buf: &[u8]) -> Result<Vec<Token>, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Empty);
    }
    let (head, body) = buf.split_at(4);
    if head != selector(sig) {
        return Err(DecodeError::Abi(format!("selector mismatch for {sig}")));
    }
    decode(params, body).map_err(|e| DecodeError::Abi(e.to_string()))
}

fn proof_tokens(proof: &MerkleProof) -> Token {
    Token::Array(
        proof
            .siblings
            .iter()
            .map(|s| Token::FixedBytes(s.as_bytes().to_vec()))
            .collect(),
    )
}

fn proof_from_tokens(leaf_index: U256, siblings: Token) -> Result<MerkleProof, DecodeError> {
    let siblings = siblings
        .into_array()
        .ok_or_else(|| DecodeError::Abi("expected sibling array".into()))?
        .into_iter()
        .map(|t| {
            t.into_fixed_bytes()
                .filter(|b| b.len() == 32)
                .map(|b| Hash::from_slice(&b))
                .ok_or_else(|| DecodeError::Abi("expected bytes32 sibling".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MerkleProof {
        leaf_index: leaf_index.as_u64(),
        siblings,
    })
}

/// `StateSender.syncState(address receiver, bytes data)`
pub struct SyncStateFn {
    pub receiver: Address,
    pub data: Vec<u8>,
}

impl SyncStateFn {
    const SIG: &'static str = "syncState(address,bytes)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Address(self.receiver),
                Token::Bytes(self.data.clone()),
            ],
        )
    }
}

/// `StateReceiver.commit(uint256 startId, uint256 endId, bytes32 root)`
pub struct CommitFn {
    pub start_id: u64,
    pub end_id: u64,
    pub root: Hash,
}

impl CommitFn {
    const SIG: &'static str = "commit(uint256,uint256,bytes32)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Uint(U256::from(self.start_id)),
                Token::Uint(U256::from(self.end_id)),
                Token::FixedBytes(self.root.as_bytes().to_vec()),
            ],
        )
    }

    pub fn decode_abi(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut tokens = decode_call(
            Self::SIG,
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::FixedBytes(32),
            ],
            buf,
        )?
        .into_iter();
        let start_id = tokens
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| DecodeError::Abi("expected startId".into()))?;
        let end_id = tokens
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| DecodeError::Abi("expected endId".into()))?;
        let root = tokens
            .next()
            .and_then(Token::into_fixed_bytes)
            .filter(|b| b.len() == 32)
            .ok_or_else(|| DecodeError::Abi("expected bytes32 root".into()))?;
        Ok(Self {
            start_id: start_id.as_u64(),
            end_id: end_id.as_u64(),
            root: Hash::from_slice(&root),
        })
    }
}

/// `StateReceiver.execute(uint256 id, uint256 leafIndex, bytes32[] proof, bytes event)`
pub struct ExecuteFn {
    pub id: u64,
    pub proof: MerkleProof,
    pub event_data: Vec<u8>,
}

impl ExecuteFn {
    const SIG: &'static str = "execute(uint256,uint256,bytes32[],bytes)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Uint(U256::from(self.id)),
                Token::Uint(U256::from(self.proof.leaf_index)),
                proof_tokens(&self.proof),
                Token::Bytes(self.event_data.clone()),
            ],
        )
    }

    pub fn decode_abi(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut tokens = decode_call(
            Self::SIG,
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Bytes,
            ],
            buf,
        )?
        .into_iter();
        let event_id = tokens
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| DecodeError::Abi("expected id".into()))?;
        let leaf_index = tokens
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| DecodeError::Abi("expected leafIndex".into()))?;
        let siblings = tokens
            .next()
            .ok_or_else(|| DecodeError::Abi("expected proof".into()))?;
        let event_data = tokens
            .next()
            .and_then(Token::into_bytes)
            .ok_or_else(|| DecodeError::Abi("expected event bytes".into()))?;
        Ok(Self {
            id: event_id.as_u64(),
            proof: proof_from_tokens(leaf_index, siblings)?,
            event_data,
        })
    }
}

/// `CheckpointManager.submit(uint256 epoch, uint256 startBlock, uint256 endBlock, bytes32 eventRoot, bytes32 blockHash)`
pub struct SubmitCheckpointFn {
    pub epoch: u64,
    pub start_block: u64,
    pub end_block: u64,
    pub event_root: Hash,
    pub block_hash: Hash,
}

impl SubmitCheckpointFn {
    const SIG: &'static str = "submit(uint256,uint256,uint256,bytes32,bytes32)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Uint(U256::from(self.epoch)),
                Token::Uint(U256::from(self.start_block)),
                Token::Uint(U256::from(self.end_block)),
                Token::FixedBytes(self.event_root.as_bytes().to_vec()),
                Token::FixedBytes(self.block_hash.as_bytes().to_vec()),
            ],
        )
    }

    pub fn decode_abi(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut tokens = decode_call(
            Self::SIG,
            &[
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
            ],
            buf,
        )?
        .into_iter();
        let mut next_uint = |name: &str| {
            tokens
                .next()
                .and_then(Token::into_uint)
                .map(|u| u.as_u64())
                .ok_or_else(|| DecodeError::Abi(format!("expected {name}")))
        };
        let epoch = next_uint("epoch")?;
        let start_block = next_uint("startBlock")?;
        let end_block = next_uint("endBlock")?;
        let mut next_hash = |name: &str| {
            tokens
                .next()
                .and_then(Token::into_fixed_bytes)
                .filter(|b| b.len() == 32)
                .map(|b| Hash::from_slice(&b))
                .ok_or_else(|| DecodeError::Abi(format!("expected {name}")))
        };
        let event_root = next_hash("eventRoot")?;
        let block_hash = next_hash("blockHash")?;
        Ok(Self {
            epoch,
            start_block,
            end_block,
            event_root,
            block_hash,
        })
    }
}

/// `ExitHelper.exit(uint256 epoch, uint256 id, uint256 leafIndex, bytes leaf, bytes32[] proof)`
pub struct ExitFn {
    pub epoch: u64,
    pub id: u64,
    pub leaf: Vec<u8>,
    pub proof: MerkleProof,
}

impl ExitFn {
    const SIG: &'static str = "exit(uint256,uint256,uint256,bytes,bytes32[])";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Uint(U256::from(self.epoch)),
                Token::Uint(U256::from(self.id)),
                Token::Uint(U256::from(self.proof.leaf_index)),
                Token::Bytes(self.leaf.clone()),
                proof_tokens(&self.proof),
            ],
        )
    }
}

/// `initialize()` on any of the bridge contracts.
pub struct InitializeFn;

impl InitializeFn {
    const SIG: &'static str = "initialize()";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(Self::SIG, &[])
    }
}

/// `RootERC20Predicate.depositTo(address receiver, uint256 amount)`
pub struct DepositToFn {
    pub receiver: Address,
    pub amount: U256,
}

impl DepositToFn {
    const SIG: &'static str = "depositTo(address,uint256)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[Token::Address(self.receiver), Token::Uint(self.amount)],
        )
    }
}

/// `ChildERC20Predicate.withdrawTo(address receiver, uint256 amount)`
pub struct WithdrawToFn {
    pub receiver: Address,
    pub amount: U256,
}

impl WithdrawToFn {
    const SIG: &'static str = "withdrawTo(address,uint256)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[Token::Address(self.receiver), Token::Uint(self.amount)],
        )
    }
}

/// `ChildValidatorSet.addToWhitelist(address[] validators)`
pub struct AddToWhitelistFn {
    pub validators: Vec<Address>,
}

impl AddToWhitelistFn {
    const SIG: &'static str = "addToWhitelist(address[])";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[Token::Array(
                self.validators.iter().copied().map(Token::Address).collect(),
            )],
        )
    }
}

/// `ChildValidatorSet.commitEpoch(uint256 epoch, uint256 startBlock, uint256 endBlock)`
pub struct CommitEpochFn {
    pub epoch: u64,
    pub start_block: u64,
    pub end_block: u64,
}

impl CommitEpochFn {
    const SIG: &'static str = "commitEpoch(uint256,uint256,uint256)";

    pub fn sig() -> [u8; 4] {
        selector(Self::SIG)
    }

    pub fn encode_abi(&self) -> Vec<u8> {
        encode_call(
            Self::SIG,
            &[
                Token::Uint(U256::from(self.epoch)),
                Token::Uint(U256::from(self.start_block)),
                Token::Uint(U256::from(self.end_block)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_are_distinct() {
        let selectors = [
            SyncStateFn::sig(),
            CommitFn::sig(),
            ExecuteFn::sig(),
            SubmitCheckpointFn::sig(),
            ExitFn::sig(),
            InitializeFn::sig(),
            DepositToFn::sig(),
            WithdrawToFn::sig(),
            AddToWhitelistFn::sig(),
            CommitEpochFn::sig(),
        ];
        let unique: std::collections::HashSet<_> = selectors.iter().collect();
        assert_eq!(unique.len(), selectors.len());
    }

    #[test]
    fn test_commit_roundtrip() {
        let call = CommitFn {
            start_id: 1,
            end_id: 5,
            root: Hash::repeat_byte(0xcd),
        };
        let encoded = call.encode_abi();
        assert_eq!(&encoded[..4], &CommitFn::sig());
        let decoded = CommitFn::decode_abi(&encoded).unwrap();
        assert_eq!(decoded.start_id, 1);
        assert_eq!(decoded.end_id, 5);
        assert_eq!(decoded.root, Hash::repeat_byte(0xcd));
    }

    #[test]
    fn test_execute_roundtrip() {
        let call = ExecuteFn {
            id: 3,
            proof: MerkleProof {
                leaf_index: 2,
                siblings: vec![Hash::repeat_byte(1), Hash::repeat_byte(2)],
            },
            event_data: b"payload".to_vec(),
        };
        let decoded = ExecuteFn::decode_abi(&call.encode_abi()).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.proof, call.proof);
        assert_eq!(decoded.event_data, call.event_data);
    }

    #[test]
    fn test_selector_mismatch_rejected() {
        let buf = SubmitCheckpointFn {
            epoch: 1,
            start_block: 1,
            end_block: 10,
            event_root: Hash::zero(),
            block_hash: Hash::zero(),
        }
        .encode_abi();
        assert!(CommitFn::decode_abi(&buf).is_err());
    }
}
