//! Keccak binary Merkle tree over pre-hashed leaves, with sibling-path
//! membership proofs. Leaf sets are padded to the next power of two with zero
//! hashes so every level pairs cleanly and proofs have a fixed shape.

use crate::Hash;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct MerkleTree {
    // layers[0] is the padded leaf level, the last layer holds the root.
    layers: Vec<Vec<Hash>>,
    leaf_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub siblings: Vec<Hash>,
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    Hash::from(keccak256(buf))
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        let leaf_count = leaves.len();
        let mut level = leaves;
        let width = leaf_count.next_power_of_two().max(1);
        level.resize(width, Hash::zero());

        let mut layers = vec![level];
        while layers.last().map(Vec::len).unwrap_or(0) > 1 {
            let prev = layers.last().unwrap();
            let next = prev
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }
        Self { layers, leaf_count }
    }

    pub fn root(&self) -> Hash {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or_else(Hash::zero)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    /// Membership proof for the leaf at `index`, or `None` when out of range.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.layers.len());
        let mut idx = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            siblings.push(layer[idx ^ 1]);
            idx >>= 1;
        }
        Some(MerkleProof {
            leaf_index: index as u64,
            siblings,
        })
    }
}

/// Recomputes the path from `leaf` up through `proof` and compares against
/// `root`. Pure and side-effect free.
pub fn verify(root: Hash, leaf: Hash, proof: &MerkleProof) -> bool {
    let mut acc = leaf;
    let mut idx = proof.leaf_index;
    for sibling in &proof.siblings {
        acc = if idx & 1 == 0 {
            hash_pair(&acc, sibling)
        } else {
            hash_pair(sibling, &acc)
        };
        idx >>= 1;
    }
    idx == 0 && acc == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(Hash::repeat_byte).collect()
    }

    #[test]
    fn test_all_leaves_verify() {
        for n in [1u8, 2, 3, 5, 8, 13] {
            let leaves = leaves(n);
            let tree = MerkleTree::from_leaves(leaves.clone());
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify(tree.root(), *leaf, &proof), "leaf {i} of {n}");
            }
        }
    }

    #[test]
    fn test_wrong_leaf_rejected() {
        let tree = MerkleTree::from_leaves(leaves(5));
        let proof = tree.proof(2).unwrap();
        assert!(!verify(tree.root(), Hash::repeat_byte(0xff), &proof));
    }

    #[test]
    fn test_wrong_index_rejected() {
        let set = leaves(5);
        let tree = MerkleTree::from_leaves(set.clone());
        let mut proof = tree.proof(2).unwrap();
        proof.leaf_index = 3;
        assert!(!verify(tree.root(), set[2], &proof));
    }

    #[test]
    fn test_out_of_range_proof() {
        let tree = MerkleTree::from_leaves(leaves(4));
        assert!(tree.proof(4).is_none());
    }

    #[test]
    fn test_root_changes_with_leaves() {
        let a = MerkleTree::from_leaves(leaves(4));
        let mut mutated = leaves(4);
        mutated[3] = Hash::repeat_byte(0x99);
        let b = MerkleTree::from_leaves(mutated);
        assert_ne!(a.root(), b.root());
    }
}
