use crate::utils::{sha256_pair, Hash256};
use log::debug;
use serde::{Deserialize, Serialize};

/// Merkle tree over an ordered list of transaction ids.
///
/// Parents are `SHA256(left || right)`. A level with an odd number of nodes
/// pairs its last node with itself. A single leaf is its own root and proves
/// membership with an empty path. Every peer must reproduce these rules bit
/// for bit or roots stop agreeing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves, the last level holds the root
    levels: Vec<Vec<Hash256>>,
}

/// Which side of the running hash the sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash256,
    pub side: Side,
}

/// Inclusion proof: sibling path from leaf to root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl MerkleTree {
    /// Build the full tree. An empty leaf set yields a tree whose root is
    /// [`Hash256::ZERO`]; blocks never get here because the chain refuses
    /// empty bodies.
    pub fn new(leaves: &[Hash256]) -> MerkleTree {
        let mut levels = vec![leaves.to_vec()];
        if leaves.is_empty() {
            return MerkleTree { levels };
        }

        let mut current = leaves.to_vec();
        while current.len() > 1 {
            let next: Vec<Hash256> = current
                .chunks(2)
                .map(|pair| sha256_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next.clone());
            current = next;
        }

        debug!(
            "Merkle tree built over {} leaves ({} levels)",
            leaves.len(),
            levels.len()
        );
        MerkleTree { levels }
    }

    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn leaf(&self, index: usize) -> Option<Hash256> {
        self.levels[0].get(index).copied()
    }

    pub fn levels(&self) -> &[Vec<Hash256>] {
        &self.levels
    }

    /// Proof for the leaf at `index`, or `None` when out of range
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if position % 2 == 0 {
                // Odd tail: the sibling is the node itself
                let sibling = level.get(position + 1).unwrap_or(&level[position]);
                ProofStep {
                    sibling: *sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: level[position - 1],
                    side: Side::Left,
                }
            };
            steps.push(step);
            position /= 2;
        }

        Some(MerkleProof { steps })
    }

    /// Fold `leaf` up through `proof` and compare with `root`
    pub fn verify(leaf: &Hash256, proof: &MerkleProof, root: &Hash256) -> bool {
        let folded = proof.steps.iter().fold(*leaf, |current, step| match step.side {
            Side::Left => sha256_pair(&step.sibling, &current),
            Side::Right => sha256_pair(&current, &step.sibling),
        });
        folded == *root
    }
}

/// Root over `leaves` without keeping the intermediate levels
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    MerkleTree::new(leaves).root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sha256_digest;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| sha256_digest(format!("tx-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        let l = leaves(1);
        let tree = MerkleTree::new(&l);
        assert_eq!(tree.root(), l[0]);

        let proof = tree.prove(0).unwrap();
        assert!(proof.is_empty());
        assert!(MerkleTree::verify(&l[0], &proof, &tree.root()));
    }

    #[test]
    fn test_two_leaves() {
        let l = leaves(2);
        assert_eq!(merkle_root(&l), sha256_pair(&l[0], &l[1]));
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let l = leaves(3);
        let left = sha256_pair(&l[0], &l[1]);
        let right = sha256_pair(&l[2], &l[2]);
        assert_eq!(merkle_root(&l), sha256_pair(&left, &right));
    }

    #[test]
    fn test_every_proof_verifies_for_many_sizes() {
        for n in 1..=100 {
            let l = leaves(n);
            let tree = MerkleTree::new(&l);
            let root = tree.root();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.prove(i).unwrap();
                assert!(
                    MerkleTree::verify(leaf, &proof, &root),
                    "proof for leaf {i} of {n} failed"
                );
            }
        }
    }

    #[test]
    fn test_wrong_leaf_or_root_fails() {
        let l = leaves(5);
        let tree = MerkleTree::new(&l);
        let proof = tree.prove(3).unwrap();
        assert!(!MerkleTree::verify(&l[2], &proof, &tree.root()));
        assert!(!MerkleTree::verify(&l[3], &proof, &sha256_digest(b"other")));
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::new(&leaves(4));
        assert!(tree.prove(4).is_none());
    }

    #[test]
    fn test_empty_tree_root_is_zero() {
        let tree = MerkleTree::new(&[]);
        assert_eq!(tree.root(), Hash256::ZERO);
        assert!(tree.prove(0).is_none());
    }

    #[test]
    fn test_order_matters() {
        let mut l = leaves(4);
        let root = merkle_root(&l);
        l.swap(0, 1);
        assert_ne!(root, merkle_root(&l));
    }

    #[test]
    fn test_proof_json_uses_side_names() {
        let tree = MerkleTree::new(&leaves(2));
        let proof = tree.prove(1).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["steps"][0]["side"], "left");
    }
}
