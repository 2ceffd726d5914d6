// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use sha2::{Digest, Sha256};

pub type MerkleHash = [u8; 32];

/// Root of the hash tree built over the ordered piece hashes.
///
/// Every piece hash becomes a leaf (`SHA-256(piece_hash)`), the leaf layer is
/// padded with zero hashes to the next power of two and then reduced pairwise.
/// An empty piece list has the all-zero root.
pub fn merkle_root(piece_hashes: &[[u8; 20]]) -> MerkleHash {
    if piece_hashes.is_empty() {
        return [0u8; 32];
    }

    let leaf_count = piece_hashes.len().next_power_of_two();
    let mut layer: Vec<MerkleHash> = piece_hashes
        .iter()
        .map(|hash| Sha256::digest(hash).into())
        .collect();
    layer.resize(leaf_count, [0u8; 32]);

    while layer.len() > 1 {
        layer = layer.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    layer[0]
}

/// Sibling path from the leaf at `index` up to (not including) the root.
pub fn merkle_proof(piece_hashes: &[[u8; 20]], index: usize) -> Option<Vec<MerkleHash>> {
    if index >= piece_hashes.len() {
        return None;
    }

    let leaf_count = piece_hashes.len().next_power_of_two();
    let mut layer: Vec<MerkleHash> = piece_hashes
        .iter()
        .map(|hash| Sha256::digest(hash).into())
        .collect();
    layer.resize(leaf_count, [0u8; 32]);

    let mut proof = Vec::new();
    let mut idx = index;
    while layer.len() > 1 {
        proof.push(layer[idx ^ 1]);
        layer = layer.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
        idx /= 2;
    }
    Some(proof)
}

/// Climbs from a single piece hash to the root using `proof`.
pub fn verify_merkle_proof(
    root: &MerkleHash,
    piece_hash: &[u8; 20],
    index: usize,
    proof: &[MerkleHash],
) -> bool {
    let mut current: MerkleHash = Sha256::digest(piece_hash).into();
    let mut idx = index;

    for sibling in proof {
        current = if idx % 2 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        idx /= 2;
    }

    &current == root
}

fn hash_pair(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<[u8; 20]> {
        (0..n).map(|i| [i; 20]).collect()
    }

    #[test]
    fn test_single_piece_root_is_leaf_hash() {
        let hashes = leaves(1);
        let expected: MerkleHash = Sha256::digest(hashes[0]).into();
        assert_eq!(merkle_root(&hashes), expected);
    }

    #[test]
    fn test_two_piece_root_combines_left_then_right() {
        let hashes = leaves(2);
        let h0: MerkleHash = Sha256::digest(hashes[0]).into();
        let h1: MerkleHash = Sha256::digest(hashes[1]).into();

        let mut hasher = Sha256::new();
        hasher.update(h0);
        hasher.update(h1);
        let expected: MerkleHash = hasher.finalize().into();

        assert_eq!(merkle_root(&hashes), expected);
    }

    #[test]
    fn test_odd_leaf_count_pads_with_zero_hashes() {
        let hashes = leaves(3);
        let h: Vec<MerkleHash> = hashes.iter().map(|x| Sha256::digest(x).into()).collect();
        let left = hash_pair(&h[0], &h[1]);
        let right = hash_pair(&h[2], &[0u8; 32]);
        assert_eq!(merkle_root(&hashes), hash_pair(&left, &right));
    }

    #[test]
    fn test_changed_piece_changes_root() {
        let mut hashes = leaves(5);
        let before = merkle_root(&hashes);
        hashes[4][0] ^= 0xFF;
        assert_ne!(before, merkle_root(&hashes));
    }

    #[test]
    fn test_proof_verifies_even_and_odd_indices() {
        let hashes = leaves(6);
        let root = merkle_root(&hashes);

        for index in 0..hashes.len() {
            let proof = merkle_proof(&hashes, index).unwrap();
            assert_eq!(proof.len(), 3);
            assert!(
                verify_merkle_proof(&root, &hashes[index], index, &proof),
                "proof for leaf {} should verify",
                index
            );
        }

        let proof = merkle_proof(&hashes, 1).unwrap();
        assert!(!verify_merkle_proof(&root, &hashes[1], 0, &proof));
        assert!(merkle_proof(&hashes, 6).is_none());
    }
}
