//! The node's persistence seam.
//!
//! Everything the optimist records between events lives behind [`Storage`]:
//! proposed blocks, the transaction pool, nullifier records, commitment
//! tree snapshots, challenge commits and fee payment references. Storage
//! failures are fatal to the current operation and are never folded into
//! the validity error taxonomies.

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::H256;
use tokio::sync::RwLock;
use willow_core::{
    Block,
    Transaction,
};
use willow_merkle::TreeState;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A stored block together with the L1 block it was proposed in. The L1
/// position is what state sync replays from after a gap or restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub block: Block,
    pub l1_block: u64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // blocks

    async fn save_block(&self, block: &Block, l1_block: u64) -> Result<(), StorageError>;
    async fn block_by_hash(&self, hash: H256) -> Result<Option<StoredBlock>, StorageError>;
    async fn block_by_number(&self, block_number_l2: u64)
        -> Result<Option<StoredBlock>, StorageError>;
    async fn block_by_root(&self, root: H256) -> Result<Option<StoredBlock>, StorageError>;
    async fn block_containing_transaction(
        &self,
        transaction_hash: H256,
    ) -> Result<Option<StoredBlock>, StorageError>;
    /// Deletes every block with `block_number_l2 >= from` and returns them
    /// in descending L2 number order, newest first.
    async fn delete_blocks_from(&self, from: u64) -> Result<Vec<StoredBlock>, StorageError>;
    /// All stored blocks in ascending L2 number order.
    async fn blocks_in_order(&self) -> Result<Vec<StoredBlock>, StorageError>;

    // transactions

    async fn save_transaction(
        &self,
        transaction: &Transaction,
        in_mempool: bool,
    ) -> Result<(), StorageError>;
    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<Transaction>, StorageError>;
    /// Mempool transactions ordered by descending fee, at most `limit`.
    async fn most_profitable_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError>;
    async fn set_in_mempool(&self, hash: H256, in_mempool: bool) -> Result<(), StorageError>;
    async fn return_to_mempool(&self, hashes: &[H256]) -> Result<(), StorageError>;
    /// Transactions that left the mempool but never landed in a stored
    /// block; stranded by an assembled-but-unproposed block.
    async fn stranded_transactions(&self) -> Result<Vec<H256>, StorageError>;

    // nullifiers

    async fn insert_nullifiers(&self, nullifiers: &[H256]) -> Result<(), StorageError>;
    async fn is_nullifier_tracked(&self, nullifier: H256) -> Result<bool, StorageError>;
    async fn mark_nullifiers_mined(
        &self,
        nullifiers: &[H256],
        block_hash: H256,
    ) -> Result<(), StorageError>;
    async fn unmark_nullifiers(&self, block_hash: H256) -> Result<(), StorageError>;
    async fn mined_block_of_nullifier(
        &self,
        nullifier: H256,
    ) -> Result<Option<H256>, StorageError>;

    // commitment tree snapshots

    async fn save_tree_state(&self, state: &TreeState) -> Result<(), StorageError>;
    async fn tree_state_by_leaf_count(
        &self,
        leaf_count: u64,
    ) -> Result<Option<TreeState>, StorageError>;
    async fn tree_state_by_root(&self, root: [u8; 32]) -> Result<Option<TreeState>, StorageError>;
    /// Deletes every snapshot with `leaf_count > keep_up_to`.
    async fn delete_tree_states_after(&self, keep_up_to: u64) -> Result<(), StorageError>;

    // challenge commits

    async fn save_challenge_commit(
        &self,
        commit_hash: H256,
        calldata: Vec<u8>,
    ) -> Result<(), StorageError>;
    async fn take_challenge_commit(
        &self,
        commit_hash: H256,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    // payment references

    /// Records a fee payment reference. Returns the L2 transaction hash the
    /// reference was previously recorded against, if any.
    async fn record_payment_reference(
        &self,
        reference: H256,
        transaction_hash: H256,
    ) -> Result<Option<H256>, StorageError>;
}

#[derive(Debug, Clone)]
struct PoolEntry {
    transaction: Transaction,
    in_mempool: bool,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: HashMap<H256, StoredBlock>,
    pool: HashMap<H256, PoolEntry>,
    // nullifier -> block hash it was mined in, None while unspent
    nullifiers: HashMap<H256, Option<H256>>,
    tree_states: HashMap<u64, TreeState>,
    challenge_commits: HashMap<H256, Vec<u8>>,
    payment_references: HashMap<H256, H256>,
}

/// The node's default store, a set of maps behind one `RwLock`. Doubles as
/// the test store.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_block(&self, block: &Block, l1_block: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.blocks.insert(
            block.block_hash(),
            StoredBlock {
                block: block.clone(),
                l1_block,
            },
        );
        Ok(())
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self.inner.read().await.blocks.get(&hash).cloned())
    }

    async fn block_by_number(
        &self,
        block_number_l2: u64,
    ) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .values()
            .find(|stored| stored.block.block_number_l2() == block_number_l2)
            .cloned())
    }

    async fn block_by_root(&self, root: H256) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .values()
            .find(|stored| stored.block.root() == root)
            .cloned())
    }

    async fn block_containing_transaction(
        &self,
        transaction_hash: H256,
    ) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .values()
            .find(|stored| {
                stored
                    .block
                    .transaction_hashes()
                    .contains(&transaction_hash)
            })
            .cloned())
    }

    async fn delete_blocks_from(&self, from: u64) -> Result<Vec<StoredBlock>, StorageError> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<H256> = inner
            .blocks
            .iter()
            .filter(|(_, stored)| stored.block.block_number_l2() >= from)
            .map(|(hash, _)| *hash)
            .collect();
        let mut deleted: Vec<StoredBlock> = doomed
            .into_iter()
            .filter_map(|hash| inner.blocks.remove(&hash))
            .collect();
        deleted.sort_by_key(|stored| std::cmp::Reverse(stored.block.block_number_l2()));
        Ok(deleted)
    }

    async fn blocks_in_order(&self) -> Result<Vec<StoredBlock>, StorageError> {
        let mut blocks: Vec<StoredBlock> =
            self.inner.read().await.blocks.values().cloned().collect();
        blocks.sort_by_key(|stored| stored.block.block_number_l2());
        Ok(blocks)
    }

    async fn save_transaction(
        &self,
        transaction: &Transaction,
        in_mempool: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.pool.insert(
            transaction.transaction_hash(),
            PoolEntry {
                transaction: transaction.clone(),
                in_mempool,
            },
        );
        Ok(())
    }

    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<Transaction>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .pool
            .get(&hash)
            .map(|entry| entry.transaction.clone()))
    }

    async fn most_profitable_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<Transaction>, StorageError> {
        let inner = self.inner.read().await;
        let mut pooled: Vec<&PoolEntry> =
            inner.pool.values().filter(|entry| entry.in_mempool).collect();
        pooled.sort_by(|a, b| b.transaction.fee().cmp(&a.transaction.fee()));
        Ok(pooled
            .into_iter()
            .take(limit)
            .map(|entry| entry.transaction.clone())
            .collect())
    }

    async fn set_in_mempool(&self, hash: H256, in_mempool: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.pool.get_mut(&hash) {
            entry.in_mempool = in_mempool;
        }
        Ok(())
    }

    async fn return_to_mempool(&self, hashes: &[H256]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for hash in hashes {
            if let Some(entry) = inner.pool.get_mut(hash) {
                entry.in_mempool = true;
            }
        }
        Ok(())
    }

    async fn stranded_transactions(&self) -> Result<Vec<H256>, StorageError> {
        let inner = self.inner.read().await;
        let mined: std::collections::HashSet<H256> = inner
            .blocks
            .values()
            .flat_map(|stored| stored.block.transaction_hashes().iter().copied())
            .collect();
        Ok(inner
            .pool
            .iter()
            .filter(|(hash, entry)| !entry.in_mempool && !mined.contains(hash))
            .map(|(hash, _)| *hash)
            .collect())
    }

    async fn insert_nullifiers(&self, nullifiers: &[H256]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for nullifier in nullifiers {
            inner.nullifiers.entry(*nullifier).or_insert(None);
        }
        Ok(())
    }

    async fn is_nullifier_tracked(&self, nullifier: H256) -> Result<bool, StorageError> {
        Ok(self.inner.read().await.nullifiers.contains_key(&nullifier))
    }

    async fn mark_nullifiers_mined(
        &self,
        nullifiers: &[H256],
        block_hash: H256,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for nullifier in nullifiers {
            inner.nullifiers.insert(*nullifier, Some(block_hash));
        }
        Ok(())
    }

    async fn unmark_nullifiers(&self, block_hash: H256) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for mined_in in inner.nullifiers.values_mut() {
            if *mined_in == Some(block_hash) {
                *mined_in = None;
            }
        }
        Ok(())
    }

    async fn mined_block_of_nullifier(
        &self,
        nullifier: H256,
    ) -> Result<Option<H256>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .nullifiers
            .get(&nullifier)
            .copied()
            .flatten())
    }

    async fn save_tree_state(&self, state: &TreeState) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.tree_states.insert(state.leaf_count(), state.clone());
        Ok(())
    }

    async fn tree_state_by_leaf_count(
        &self,
        leaf_count: u64,
    ) -> Result<Option<TreeState>, StorageError> {
        if leaf_count == 0 {
            return Ok(Some(TreeState::empty()));
        }
        Ok(self.inner.read().await.tree_states.get(&leaf_count).cloned())
    }

    async fn tree_state_by_root(
        &self,
        root: [u8; 32],
    ) -> Result<Option<TreeState>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .tree_states
            .values()
            .find(|state| state.root() == root)
            .cloned())
    }

    async fn delete_tree_states_after(&self, keep_up_to: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.tree_states.retain(|leaf_count, _| *leaf_count <= keep_up_to);
        Ok(())
    }

    async fn save_challenge_commit(
        &self,
        commit_hash: H256,
        calldata: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.challenge_commits.insert(commit_hash, calldata);
        Ok(())
    }

    async fn take_challenge_commit(
        &self,
        commit_hash: H256,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.write().await.challenge_commits.remove(&commit_hash))
    }

    async fn record_payment_reference(
        &self,
        reference: H256,
        transaction_hash: H256,
    ) -> Result<Option<H256>, StorageError> {
        let mut inner = self.inner.write().await;
        let previous = inner.payment_references.get(&reference).copied();
        inner.payment_references.insert(reference, transaction_hash);
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::{
        Address,
        U256,
    };
    use willow_core::{
        transaction::TransactionType,
        Proof,
        TransactionBuilder,
    };

    use super::*;

    fn word(i: u8) -> H256 {
        let mut out = [0; 32];
        out[31] = i;
        H256::from(out)
    }

    fn valid_proof() -> Proof {
        let p = U256::from_dec_str(
            "21888242871839275222246405745257275088696311157297823662689037894645226208583",
        )
        .unwrap();
        let one = U256::from(1);
        let two = U256::from(2);
        Proof::new([one, two, one, one, two, p - 2, one, two])
    }

    fn deposit(fee: u64, commitment: u8) -> Transaction {
        TransactionBuilder::new(TransactionType::Deposit, valid_proof())
            .value(U256::from(10))
            .fee(U256::from(fee))
            .erc_address(word(0xaa))
            .commitments(vec![word(commitment)])
            .build()
    }

    #[tokio::test]
    async fn mempool_orders_by_fee_and_respects_limit() {
        let storage = InMemoryStorage::new();
        let cheap = deposit(1, 0x01);
        let middling = deposit(5, 0x02);
        let dear = deposit(9, 0x03);
        for tx in [&cheap, &middling, &dear] {
            storage.save_transaction(tx, true).await.unwrap();
        }

        let picked = storage.most_profitable_transactions(2).await.unwrap();
        assert_eq!(
            vec![dear.transaction_hash(), middling.transaction_hash()],
            picked
                .iter()
                .map(Transaction::transaction_hash)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn off_mempool_transactions_are_not_picked() {
        let storage = InMemoryStorage::new();
        let tx = deposit(3, 0x01);
        storage.save_transaction(&tx, true).await.unwrap();
        storage
            .set_in_mempool(tx.transaction_hash(), false)
            .await
            .unwrap();
        assert!(storage
            .most_profitable_transactions(10)
            .await
            .unwrap()
            .is_empty());
        storage
            .return_to_mempool(&[tx.transaction_hash()])
            .await
            .unwrap();
        assert_eq!(
            1,
            storage.most_profitable_transactions(10).await.unwrap().len()
        );
    }

    #[tokio::test]
    async fn rollback_deletion_returns_blocks_newest_first() {
        let storage = InMemoryStorage::new();
        for number in 0..4 {
            let block = Block::new(Address::repeat_byte(1), word(number as u8 + 1), 0, number, &[]);
            storage.save_block(&block, 100 + number).await.unwrap();
        }

        let deleted = storage.delete_blocks_from(2).await.unwrap();
        assert_eq!(
            vec![3, 2],
            deleted
                .iter()
                .map(|stored| stored.block.block_number_l2())
                .collect::<Vec<_>>()
        );
        assert_eq!(2, storage.blocks_in_order().await.unwrap().len());
    }

    #[tokio::test]
    async fn nullifier_lifecycle_round_trips() {
        let storage = InMemoryStorage::new();
        let nullifier = word(0x22);
        let block_hash = word(0xbb);

        storage.insert_nullifiers(&[nullifier]).await.unwrap();
        assert!(storage.is_nullifier_tracked(nullifier).await.unwrap());
        assert_eq!(
            None,
            storage.mined_block_of_nullifier(nullifier).await.unwrap()
        );

        storage
            .mark_nullifiers_mined(&[nullifier], block_hash)
            .await
            .unwrap();
        assert_eq!(
            Some(block_hash),
            storage.mined_block_of_nullifier(nullifier).await.unwrap()
        );

        storage.unmark_nullifiers(block_hash).await.unwrap();
        assert_eq!(
            None,
            storage.mined_block_of_nullifier(nullifier).await.unwrap()
        );
        assert!(storage.is_nullifier_tracked(nullifier).await.unwrap());
    }

    #[tokio::test]
    async fn blocks_resolve_by_root_and_by_contained_transaction() {
        let storage = InMemoryStorage::new();
        let tx = deposit(3, 0x01);
        let block = Block::new(Address::repeat_byte(1), word(0xcd), 0, 0, &[tx.clone()]);
        storage.save_block(&block, 12).await.unwrap();

        let by_root = storage.block_by_root(word(0xcd)).await.unwrap().unwrap();
        assert_eq!(block.block_hash(), by_root.block.block_hash());
        assert_eq!(12, by_root.l1_block);

        let containing = storage
            .block_containing_transaction(tx.transaction_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.block_hash(), containing.block.block_hash());
        assert!(storage.block_by_root(word(0xce)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tree_snapshots_resolve_by_root() {
        let storage = InMemoryStorage::new();
        let state = TreeState::empty().append(&[[1; 32]]).unwrap();
        storage.save_tree_state(&state).await.unwrap();
        assert_eq!(
            Some(state.clone()),
            storage.tree_state_by_root(state.root()).await.unwrap()
        );
        assert!(storage.tree_state_by_root([9; 32]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_tree_state_is_always_available() {
        let storage = InMemoryStorage::new();
        let state = storage.tree_state_by_leaf_count(0).await.unwrap().unwrap();
        assert_eq!(0, state.leaf_count());
    }

    #[tokio::test]
    async fn tree_snapshots_are_pruned_from_a_leaf_count() {
        let storage = InMemoryStorage::new();
        let s1 = TreeState::empty().append(&[[1; 32]]).unwrap();
        let s2 = s1.append(&[[2; 32], [3; 32]]).unwrap();
        storage.save_tree_state(&s1).await.unwrap();
        storage.save_tree_state(&s2).await.unwrap();

        storage.delete_tree_states_after(1).await.unwrap();
        assert!(storage.tree_state_by_leaf_count(1).await.unwrap().is_some());
        assert!(storage.tree_state_by_leaf_count(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn challenge_commits_are_taken_once() {
        let storage = InMemoryStorage::new();
        let commit = word(0xcc);
        storage
            .save_challenge_commit(commit, vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(
            Some(vec![1, 2, 3]),
            storage.take_challenge_commit(commit).await.unwrap()
        );
        assert_eq!(None, storage.take_challenge_commit(commit).await.unwrap());
    }

    #[tokio::test]
    async fn payment_references_report_prior_bindings() {
        let storage = InMemoryStorage::new();
        let reference = word(0x77);
        assert_eq!(
            None,
            storage
                .record_payment_reference(reference, word(0x01))
                .await
                .unwrap()
        );
        assert_eq!(
            Some(word(0x01)),
            storage
                .record_payment_reference(reference, word(0x02))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn stranded_transactions_are_off_mempool_and_unmined() {
        let storage = InMemoryStorage::new();
        let stranded = deposit(1, 0x01);
        let mined = deposit(2, 0x02);
        storage.save_transaction(&stranded, false).await.unwrap();
        storage.save_transaction(&mined, false).await.unwrap();
        let block = Block::new(Address::repeat_byte(1), word(0xee), 0, 0, &[mined.clone()]);
        storage.save_block(&block, 7).await.unwrap();

        assert_eq!(
            vec![stranded.transaction_hash()],
            storage.stranded_transactions().await.unwrap()
        );
    }
}
