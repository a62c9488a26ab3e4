//! Merkle trees over sectors and sector-root lists.
//!
//! All hashing uses the chain's domain-separated convention: BLAKE2b-256
//! with a `0x00` prefix on 64-byte leaves and a `0x01` prefix on interior
//! nodes. A sector is a full binary tree of 65,536 leaves; a file is a
//! left-leaning tree whose height-16 subtrees are the sector roots.

use keep_types::Hash256;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: usize = 1 << 22;
/// Size of a Merkle leaf in bytes.
pub const LEAF_SIZE: usize = 64;
/// Number of leaves in a sector.
pub const LEAVES_PER_SECTOR: u64 = (SECTOR_SIZE / LEAF_SIZE) as u64;
/// Depth of the intra-sector tree; also the length of a segment proof.
pub const SECTOR_TREE_DEPTH: usize = 16;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn hasher() -> blake2b_simd::State {
    blake2b_simd::Params::new().hash_length(32).to_state()
}

fn leaf_hash(leaf: &[u8]) -> Hash256 {
    let mut state = hasher();
    state.update(&[LEAF_PREFIX]);
    state.update(leaf);
    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    Hash256(out)
}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut state = hasher();
    state.update(&[NODE_PREFIX]);
    state.update(left.as_bytes());
    state.update(right.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    Hash256(out)
}

/// Computes the Merkle root of a full 4 MiB sector.
///
/// Panics if `sector` is not exactly `SECTOR_SIZE` bytes; sectors are
/// fixed-size by construction everywhere in the host.
pub fn sector_root(sector: &[u8]) -> Hash256 {
    assert_eq!(sector.len(), SECTOR_SIZE, "sector must be exactly 4 MiB");

    // Stack merge: push each leaf hash, collapsing equal-height subtrees.
    // The leaf count is a power of two, so the stack drains to one root.
    let mut stack: Vec<Hash256> = Vec::with_capacity(SECTOR_TREE_DEPTH + 1);
    for (i, leaf) in sector.chunks_exact(LEAF_SIZE).enumerate() {
        let mut node = leaf_hash(leaf);
        let mut merged = i + 1;
        while merged & 1 == 0 {
            let left = stack.pop().expect("stack holds a subtree per set bit");
            node = node_hash(&left, &node);
            merged >>= 1;
        }
        stack.push(node);
    }
    stack.pop().expect("power-of-two leaf count leaves one root")
}

/// Computes the file Merkle root over an ordered list of sector roots.
///
/// Sector roots are height-16 subtree roots; trailing subtrees that cannot
/// pair are folded in right-to-left, giving the chain's left-leaning
/// unbalanced tree. An empty list hashes to the zero root.
pub fn meta_root(roots: &[Hash256]) -> Hash256 {
    if roots.is_empty() {
        return Hash256::default();
    }

    // (height, root) stack with the same collapse rule as sector_root.
    let mut stack: Vec<Hash256> = Vec::new();
    for (i, root) in roots.iter().enumerate() {
        let mut node = *root;
        let mut merged = i + 1;
        while merged & 1 == 0 {
            let left = stack.pop().expect("stack holds a subtree per set bit");
            node = node_hash(&left, &node);
            merged >>= 1;
        }
        stack.push(node);
    }
    let mut root = stack.pop().expect("non-empty root list");
    while let Some(left) = stack.pop() {
        root = node_hash(&left, &root);
    }
    root
}

/// Root of the balanced subtree covering `leaves[start..end)`.
/// `end - start` must be a power of two.
fn subtree_root_of_leaves(sector: &[u8], start: u64, end: u64) -> Hash256 {
    debug_assert!((end - start).is_power_of_two());
    if end - start == 1 {
        let offset = start as usize * LEAF_SIZE;
        return leaf_hash(&sector[offset..offset + LEAF_SIZE]);
    }
    let mid = start + (end - start) / 2;
    node_hash(
        &subtree_root_of_leaves(sector, start, mid),
        &subtree_root_of_leaves(sector, mid, end),
    )
}

/// Root of the balanced subtree covering `roots[start..end)`.
fn subtree_root_of_roots(roots: &[Hash256], start: u64, end: u64) -> Hash256 {
    debug_assert!((end - start).is_power_of_two());
    if end - start == 1 {
        return roots[start as usize];
    }
    let mid = start + (end - start) / 2;
    node_hash(
        &subtree_root_of_roots(roots, start, mid),
        &subtree_root_of_roots(roots, mid, end),
    )
}

/// Builds a range proof for leaves `[proof_start, proof_end)` of a sector.
///
/// The proof lists the roots of the maximal subtrees left of the range,
/// then those right of it, both in left-to-right order. For a single leaf
/// this yields exactly `SECTOR_TREE_DEPTH` hashes.
pub fn build_proof(sector: &[u8], proof_start: u64, proof_end: u64) -> Vec<Hash256> {
    assert_eq!(sector.len(), SECTOR_SIZE, "sector must be exactly 4 MiB");
    assert!(
        proof_start < proof_end && proof_end <= LEAVES_PER_SECTOR,
        "invalid proof range"
    );

    let mut proof = Vec::with_capacity(SECTOR_TREE_DEPTH);
    // Walk the implicit tree; subtrees fully outside the range contribute
    // their root, subtrees fully inside contribute nothing.
    fn recurse(
        sector: &[u8],
        lo: u64,
        hi: u64,
        start: u64,
        end: u64,
        proof: &mut Vec<Hash256>,
    ) {
        if lo >= end || hi <= start {
            proof.push(subtree_root_of_leaves(sector, lo, hi));
        } else if start <= lo && hi <= end {
            // fully covered by the range
        } else {
            let mid = lo + (hi - lo) / 2;
            recurse(sector, lo, mid, start, end, proof);
            recurse(sector, mid, hi, start, end, proof);
        }
    }
    recurse(sector, 0, LEAVES_PER_SECTOR, proof_start, proof_end, &mut proof);
    proof
}

/// Largest power-of-two subtree size aligned at `start` that fits within
/// `[start, end)`.
fn next_subtree_size(start: u64, end: u64) -> u64 {
    let ideal = if start == 0 { 63 } else { start.trailing_zeros() };
    let max = 63 - (end - start).leading_zeros();
    1u64 << ideal.min(max)
}

/// Builds a range proof for sector roots `[proof_start, proof_end)` within
/// a file of `roots.len()` sectors.
pub fn build_sector_range_proof(roots: &[Hash256], proof_start: u64, proof_end: u64) -> Vec<Hash256> {
    assert!(
        proof_start < proof_end && proof_end <= roots.len() as u64,
        "invalid proof range"
    );

    let mut proof = Vec::new();
    let mut build_range = |mut i: u64, j: u64, proof: &mut Vec<Hash256>| {
        while i < j {
            let subtree = next_subtree_size(i, j);
            proof.push(subtree_root_of_roots(roots, i, i + subtree));
            i += subtree;
        }
    };
    build_range(0, proof_start, &mut proof);
    build_range(proof_end, roots.len() as u64, &mut proof);
    proof
}

/// Reorders a single-leaf range proof into the consensus storage-proof
/// convention: siblings ordered by depth, leaf outward.
///
/// A range proof for leaf `index` lists the left-sibling subtree roots
/// first (one per set bit of `index`), then the right siblings. The
/// consensus verifier consumes siblings leaf-to-root, taking left siblings
/// from the back of the left group and right siblings from the front of
/// the right group.
pub fn convert_proof_ordering(proof: &[Hash256], index: u64) -> Vec<Hash256> {
    let num_lefts = index.count_ones() as usize;
    let (lefts, rights) = proof.split_at(num_lefts);
    let mut lefts = lefts.to_vec();
    let mut right_iter = rights.iter();

    let mut ordered = Vec::with_capacity(proof.len());
    let mut bit = 0;
    while ordered.len() < proof.len() {
        if index & (1 << bit) != 0 {
            ordered.push(lefts.pop().expect("one left sibling per set bit"));
        } else if let Some(&right) = right_iter.next() {
            ordered.push(right);
        }
        bit += 1;
    }
    ordered
}

/// Verifies a consensus-ordered storage proof against a file Merkle root.
///
/// `num_leaves` is the total leaf count of the file (filesize / 64,
/// rounded up). Mirrors the chain's unbalanced-tree verifier: complete
/// subtrees pick the sibling side from the leaf index, then the uneven
/// right edge and the remaining left spine fold in.
pub fn verify_storage_proof(
    root: &Hash256,
    segment: &[u8; LEAF_SIZE],
    hash_set: &[Hash256],
    leaf_index: u64,
    num_leaves: u64,
) -> bool {
    if num_leaves == 0 {
        // Empty-file proof: nothing to prove beyond an empty hash set.
        return hash_set.is_empty() && root.is_zero();
    }
    if leaf_index >= num_leaves {
        return false;
    }

    let mut sum = leaf_hash(segment);
    let mut height: u32 = 1;
    let mut used = 0usize;

    // Complete subtrees containing the leaf.
    let mut stable_end = leaf_index;
    loop {
        let subtree_start = (leaf_index >> height) << height;
        let subtree_end = subtree_start + (1u64 << height) - 1;
        if subtree_end >= num_leaves {
            break;
        }
        stable_end = subtree_end;
        let Some(sibling) = hash_set.get(used) else {
            return false;
        };
        if leaf_index - subtree_start < (1u64 << (height - 1)) {
            sum = node_hash(&sum, sibling);
        } else {
            sum = node_hash(sibling, &sum);
        }
        used += 1;
        height += 1;
    }

    // The irregular right edge, if the leaf's subtree does not close the
    // file.
    if stable_end != num_leaves - 1 {
        let Some(sibling) = hash_set.get(used) else {
            return false;
        };
        sum = node_hash(&sum, sibling);
        used += 1;
    }

    // Remaining left spine.
    while used < hash_set.len() {
        sum = node_hash(&hash_set[used], &sum);
        used += 1;
    }

    sum == *root
}
