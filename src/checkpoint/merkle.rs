//! Binary Merkle tree over hex-encoded SHA-256 leaves.
//!
//! Interior nodes are `SHA-256(left || right)` over the raw 32-byte
//! children. An odd node at any level is paired with itself. A single leaf
//! is its own root.
//!
//! Leaves and interior nodes share one hash domain, so a proof only means
//! something for a known leaf count. Proofs carry the count they were built
//! for and must be checked against the covering checkpoint's `event_count`.

use crate::error::{Result, VaultError};
use crate::hash::is_hash_hex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Node = [u8; 32];

fn decode_leaf(leaf: &str) -> Result<Node> {
    if !is_hash_hex(leaf) {
        return Err(VaultError::CheckpointInvalid(format!(
            "leaf '{}' is not a hex SHA-256 digest",
            leaf
        )));
    }
    let bytes = hex::decode(leaf)
        .map_err(|e| VaultError::CheckpointInvalid(format!("leaf '{}' is not hex: {}", leaf, e)))?;
    bytes
        .try_into()
        .map_err(|_| VaultError::CheckpointInvalid(format!("leaf '{}' is not 32 bytes", leaf)))
}

/// Number of levels above the leaves in a tree of `leaf_count` leaves.
fn tree_depth(leaf_count: usize) -> usize {
    let mut width = leaf_count;
    let mut depth = 0;
    while width > 1 {
        width = width.div_ceil(2);
        depth += 1;
    }
    depth
}

fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn next_level(level: &[Node]) -> Vec<Node> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

fn decode_all(leaves: &[String]) -> Result<Vec<Node>> {
    if leaves.is_empty() {
        return Err(VaultError::CheckpointInvalid("no leaves".to_string()));
    }
    leaves.iter().map(|l| decode_leaf(l)).collect()
}

/// Root over `leaves` in the given order.
pub fn merkle_root(leaves: &[String]) -> Result<String> {
    let mut level = decode_all(leaves)?;
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(hex::encode(level[0]))
}

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// Path from one leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: usize,
    /// Leaves in the tree the proof was built from.
    pub leaf_count: usize,
    pub leaf: String,
    pub path: Vec<ProofStep>,
}

/// Inclusion proof for `leaves[index]`.
pub fn build_proof(leaves: &[String], index: usize) -> Result<InclusionProof> {
    let mut level = decode_all(leaves)?;
    if index >= level.len() {
        return Err(VaultError::CheckpointInvalid(format!(
            "leaf index {} out of range for {} leaves",
            index,
            level.len()
        )));
    }

    let mut path = Vec::new();
    let mut pos = index;
    while level.len() > 1 {
        let step = if pos % 2 == 0 {
            // A missing right sibling means the node is paired with itself.
            let sibling = level.get(pos + 1).unwrap_or(&level[pos]);
            ProofStep {
                sibling: hex::encode(sibling),
                side: Side::Right,
            }
        } else {
            ProofStep {
                sibling: hex::encode(level[pos - 1]),
                side: Side::Left,
            }
        };
        path.push(step);
        level = next_level(&level);
        pos /= 2;
    }

    Ok(InclusionProof {
        leaf_index: index,
        leaf_count: leaves.len(),
        leaf: leaves[index].clone(),
        path,
    })
}

/// True if `proof` leads from its leaf to `root` through a tree of
/// `proof.leaf_count` leaves.
///
/// The path length and the side taken at each level must match the leaf's
/// position, so an interior node cannot stand in for a leaf of the same
/// tree. The caller still has to check `leaf_count` against the
/// checkpoint's `event_count`.
pub fn verify_proof(proof: &InclusionProof, root: &str) -> bool {
    if proof.leaf_index >= proof.leaf_count
        || proof.path.len() != tree_depth(proof.leaf_count)
        || !is_hash_hex(root)
    {
        return false;
    }
    let Ok(mut current) = decode_leaf(&proof.leaf) else {
        return false;
    };
    let mut pos = proof.leaf_index;
    for step in &proof.path {
        let expected_side = if pos % 2 == 0 { Side::Right } else { Side::Left };
        if step.side != expected_side {
            return false;
        }
        pos /= 2;
        let Ok(sibling) = decode_leaf(&step.sibling) else {
            return false;
        };
        current = match step.side {
            Side::Left => hash_pair(&sibling, &current),
            Side::Right => hash_pair(&current, &sibling),
        };
    }
    hex::encode(current) == root.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("leaf-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l).unwrap(), l[0]);
    }

    #[test]
    fn test_two_leaves() {
        let l = vec!["aa".repeat(32), "bb".repeat(32)];
        let mut buf = vec![0xaa; 32];
        buf.extend_from_slice(&[0xbb; 32]);
        assert_eq!(merkle_root(&l).unwrap(), sha256_hex(&buf));
    }

    #[test]
    fn test_odd_leaf_paired_with_itself() {
        let l = vec!["aa".repeat(32), "bb".repeat(32), "cc".repeat(32)];
        let root = merkle_root(&l).unwrap();

        let ab = merkle_root(&l[..2]).unwrap();
        let cc = merkle_root(&[l[2].clone(), l[2].clone()]).unwrap();
        assert_eq!(root, merkle_root(&[ab, cc]).unwrap());

        // Deterministic, order-sensitive, and every leaf counts.
        assert_eq!(root, merkle_root(&l).unwrap());
        assert_ne!(root, merkle_root(&[l[1].clone(), l[0].clone(), l[2].clone()]).unwrap());
        assert_ne!(root, merkle_root(&l[..2]).unwrap());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(merkle_root(&[]).is_err());
        assert!(merkle_root(&["zz".repeat(32)]).is_err());
        assert!(merkle_root(&["ab".to_string()]).is_err());
    }

    #[test]
    fn test_proofs_for_every_leaf() {
        for n in [1, 2, 3, 5, 8, 13] {
            let l = leaves(n);
            let root = merkle_root(&l).unwrap();
            for i in 0..n {
                let proof = build_proof(&l, i).unwrap();
                assert!(verify_proof(&proof, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_proof_fails_against_other_root() {
        let l = leaves(4);
        let proof = build_proof(&l, 2).unwrap();
        let other = merkle_root(&leaves(5)).unwrap();
        assert!(!verify_proof(&proof, &other));

        let mut forged = proof.clone();
        forged.leaf = sha256_hex(b"forged");
        assert!(!verify_proof(&forged, &merkle_root(&l).unwrap()));
        assert!(build_proof(&l, 4).is_err());
    }

    #[test]
    fn test_tree_depth() {
        assert_eq!(tree_depth(1), 0);
        assert_eq!(tree_depth(2), 1);
        assert_eq!(tree_depth(3), 2);
        assert_eq!(tree_depth(8), 3);
        assert_eq!(tree_depth(9), 4);
    }

    #[test]
    fn test_interior_node_cannot_pass_as_leaf() {
        let l = leaves(4);
        let root = merkle_root(&l).unwrap();
        let left = merkle_root(&l[..2]).unwrap();
        let right = merkle_root(&l[2..]).unwrap();

        // Claiming the interior node as a leaf of the four-leaf tree fails on
        // path length.
        let forged = InclusionProof {
            leaf_index: 0,
            leaf_count: 4,
            leaf: left,
            path: vec![ProofStep {
                sibling: right,
                side: Side::Right,
            }],
        };
        assert!(!verify_proof(&forged, &root));

        // Shrinking the claimed tree makes the path consistent, which is why
        // callers compare leaf_count with the checkpoint's event_count.
        let shrunk = InclusionProof {
            leaf_count: 2,
            ..forged
        };
        assert!(verify_proof(&shrunk, &root));
        assert_ne!(shrunk.leaf_count, l.len());
    }

    #[test]
    fn test_proof_side_must_match_index() {
        let l = leaves(5);
        let root = merkle_root(&l).unwrap();
        let mut proof = build_proof(&l, 3).unwrap();
        assert!(verify_proof(&proof, &root));

        proof.leaf_index = 2;
        assert!(!verify_proof(&proof, &root));

        let mut resized = build_proof(&l, 4).unwrap();
        assert!(verify_proof(&resized, &root));
        resized.leaf_count = 16;
        assert!(!verify_proof(&resized, &root));
    }

    #[test]
    fn test_rejects_malformed_root() {
        let l = leaves(2);
        let proof = build_proof(&l, 0).unwrap();
        assert!(!verify_proof(&proof, "not-a-root"));
    }
}
