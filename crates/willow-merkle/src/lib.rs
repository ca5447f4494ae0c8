//! An append-only Merkle accumulator with a compact "frontier" representation.
//!
//! The accumulator tracks a fixed-height keccak256 Merkle tree by storing only
//! the rightmost completed left-sibling hash at every level (the *frontier*)
//! together with the number of leaves appended so far. That is enough state to
//! append further leaves and to recompute the root, without ever materialising
//! the tree, so a snapshot is `O(log n)` in size.
//!
//! The hashing rules replicate the on-chain verifier bit for bit:
//!
//! + inner nodes are `keccak256(left || right)` over 32-byte words,
//! + a subtree that contains no leaves contributes the all-zero word at
//!   whatever level it sits, *not* a recursively-hashed chain of zeros,
//! + the root of the empty tree is the all-zero word.
//!
//! Block validity hinges on root equality with the chain's own recomputation,
//! so [`TreeState::append`] is deliberately a pure function: the same
//! `(frontier, leaf_count, leaves)` triple always yields the same state.
//!
//! # Examples
//! ```
//! use willow_merkle::TreeState;
//!
//! let empty = TreeState::empty();
//! let one = empty.append(&[[1; 32]]).unwrap();
//! let two = one.append(&[[2; 32]]).unwrap();
//!
//! // appending in batches or one by one gives the same tree
//! assert_eq!(two, empty.append(&[[1; 32], [2; 32]]).unwrap());
//! assert_eq!(2, two.leaf_count());
//! ```

use serde::{
    Deserialize,
    Serialize,
};
use sha3::{
    Digest as _,
    Keccak256,
};


/// Height of the commitment tree. Fixed by the on-chain verifier.
pub const TREE_HEIGHT: usize = 32;

/// The all-zero word standing in for an empty subtree at every level.
pub const ZERO_HASH: [u8; 32] = [0; 32];

/// Calculates `keccak256(left || right)`.
#[must_use]
pub fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("appending {leaves} leaves to a tree holding {leaf_count} exceeds the tree capacity")]
pub struct TreeFull {
    leaf_count: u64,
    leaves: u64,
}

/// The per-level rightmost completed left-sibling hashes of the tree.
///
/// Only occupied levels are stored; [`Frontier::to_padded`] pads with the
/// zero sentinel up to `TREE_HEIGHT + 1` entries, which is the layout the
/// ledger's challenge functions expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontier {
    slots: Vec<[u8; 32]>,
}

impl Frontier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs a frontier from slots previously read out of storage.
    #[must_use]
    pub fn from_slots(slots: Vec<[u8; 32]>) -> Self {
        Self {
            slots,
        }
    }

    #[must_use]
    pub fn slots(&self) -> &[[u8; 32]] {
        &self.slots
    }

    /// Returns the frontier padded with zero words to `TREE_HEIGHT + 1` entries.
    #[must_use]
    pub fn to_padded(&self) -> Vec<[u8; 32]> {
        let mut padded = self.slots.clone();
        padded.resize(TREE_HEIGHT + 1, ZERO_HASH);
        padded
    }

    fn get(&self, level: usize) -> [u8; 32] {
        self.slots.get(level).copied().unwrap_or(ZERO_HASH)
    }

    fn set(&mut self, level: usize, value: [u8; 32]) {
        if self.slots.len() <= level {
            self.slots.resize(level + 1, ZERO_HASH);
        }
        self.slots[level] = value;
    }
}

/// A snapshot of the accumulator: root, frontier and number of leaves.
///
/// One snapshot exists per historical root; replaying [`TreeState::append`]
/// over a snapshot with the batch of leaves that followed it reproduces the
/// next historical root exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    root: [u8; 32],
    frontier: Frontier,
    leaf_count: u64,
}

impl TreeState {
    /// The state of the tree before any leaf was appended.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            root: ZERO_HASH,
            frontier: Frontier::new(),
            leaf_count: 0,
        }
    }

    /// Reassembles a snapshot from parts previously read out of storage.
    ///
    /// The parts are trusted; no consistency check between `root` and
    /// `frontier` is performed here.
    #[must_use]
    pub fn from_parts(root: [u8; 32], frontier: Frontier, leaf_count: u64) -> Self {
        Self {
            root,
            frontier,
            leaf_count,
        }
    }

    #[must_use]
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    #[must_use]
    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// The maximum number of leaves the tree can hold.
    #[must_use]
    pub fn capacity() -> u64 {
        1 << TREE_HEIGHT
    }

    /// Appends a batch of leaves, returning the resulting snapshot.
    ///
    /// This is a pure, stateless update: `self` is unchanged and the result
    /// is byte-identical to the on-chain recomputation over the same inputs.
    ///
    /// # Errors
    /// Returns [`TreeFull`] if the batch would grow the tree beyond
    /// `2^TREE_HEIGHT` leaves.
    pub fn append(&self, leaves: &[[u8; 32]]) -> Result<Self, TreeFull> {
        let leaves_len = leaves.len() as u64;
        if self.leaf_count + leaves_len > Self::capacity() {
            return Err(TreeFull {
                leaf_count: self.leaf_count,
                leaves: leaves_len,
            });
        }
        let mut frontier = self.frontier.clone();
        let mut leaf_count = self.leaf_count;
        for leaf in leaves {
            insert_leaf(&mut frontier, leaf_count, *leaf);
            leaf_count += 1;
        }
        let root = derive_root(&frontier, leaf_count);
        Ok(Self {
            root,
            frontier,
            leaf_count,
        })
    }
}

/// Writes a single leaf into the frontier.
///
/// Walking up from the leaf, the new node is folded into its left sibling
/// for as long as it is a right child; the first time it lands on a left
/// slot it becomes the new frontier entry at that level.
fn insert_leaf(frontier: &mut Frontier, leaf_count: u64, leaf: [u8; 32]) {
    let mut node = leaf;
    let mut index = leaf_count;
    let mut level = 0;
    loop {
        if index % 2 == 0 {
            frontier.set(level, node);
            break;
        }
        node = combine(&frontier.get(level), &node);
        index /= 2;
        level += 1;
    }
}

/// Recomputes the root of a tree holding `leaf_count` leaves from its frontier.
///
/// At each level the running hash covers the rightmost partial subtree; it is
/// combined with the frontier entry when that subtree is a right child and
/// with the zero sentinel when it is a left child. An empty partial subtree
/// stays the literal zero word, matching the on-chain rules.
fn derive_root(frontier: &Frontier, leaf_count: u64) -> [u8; 32] {
    if leaf_count == 0 {
        return ZERO_HASH;
    }
    if leaf_count == TreeState::capacity() {
        return frontier.get(TREE_HEIGHT);
    }
    let mut cur = ZERO_HASH;
    let mut occupied = false;
    let mut index = leaf_count;
    for level in 0..TREE_HEIGHT {
        if index % 2 == 1 {
            cur = combine(&frontier.get(level), &cur);
            occupied = true;
        } else if occupied {
            cur = combine(&cur, &ZERO_HASH);
        }
        index /= 2;
    }
    cur
}
