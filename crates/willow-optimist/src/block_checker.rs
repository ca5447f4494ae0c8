//! Validity checks for a proposed block against locally replayed state.
//!
//! Callers guarantee the transaction batch matches the block's hash list
//! in order. First failure wins; the cheap local checks run before the
//! per-transaction proof work, since a failed early check makes the
//! expensive ones moot.
//!
//! The orchestrator persists blocks before checking them, so every lookup
//! here must ignore records pointing back at the block under check.

use std::collections::HashMap;

use ethers::types::H256;
use eyre::eyre;
use willow_core::{
    Block,
    BlockError,
    Transaction,
};

use crate::{
    ledger::Ledger,
    storage::{
        Storage,
        StorageError,
    },
    transaction_checker::{
        check_transaction,
        CheckError,
    },
    verifier::ProofVerifier,
};

#[derive(Debug, thiserror::Error)]
pub enum BlockCheckError {
    /// The block is fraudulent; drives the challenge path.
    #[error(transparent)]
    Invalid(#[from] BlockError),
    /// The check itself could not run; aborts the current operation.
    #[error("{0}")]
    Internal(eyre::Report),
}

impl From<StorageError> for BlockCheckError {
    fn from(err: StorageError) -> Self {
        Self::Internal(err.into())
    }
}

/// # Errors
/// `BlockCheckError::Invalid` with the first violated rule, or
/// `BlockCheckError::Internal` when storage, the verifier or a required
/// tree snapshot is unavailable.
pub async fn check_block(
    block: &Block,
    transactions: &[Transaction],
    storage: &dyn Storage,
    verifier: &dyn ProofVerifier,
    ledger: &dyn Ledger,
) -> Result<(), BlockCheckError> {
    // leaf count first: the root check keys its snapshot lookup on the
    // declared count, so a fabricated count must be caught here rather
    // than surface as a missing-snapshot internal error
    check_leaf_count(block, storage).await?;
    check_root(block, transactions, storage).await?;
    check_duplicate_submission(block, transactions, storage).await?;
    check_nullifiers(block, transactions, storage).await?;

    for (index, transaction) in transactions.iter().enumerate() {
        match check_transaction(transaction, storage, verifier, ledger).await {
            Ok(()) => {}
            Err(CheckError::Invalid(err)) => {
                return Err(BlockError::from_transaction_error(&err, index).into());
            }
            Err(CheckError::Internal(report)) => {
                return Err(BlockCheckError::Internal(report));
            }
        }
    }
    Ok(())
}

async fn check_root(
    block: &Block,
    transactions: &[Transaction],
    storage: &dyn Storage,
) -> Result<(), BlockCheckError> {
    let state = storage
        .tree_state_by_leaf_count(block.leaf_count())
        .await?
        .ok_or_else(|| {
            BlockCheckError::Internal(eyre!(
                "no tree snapshot at leaf count {}; block cannot be checked",
                block.leaf_count()
            ))
        })?;
    let commitments: Vec<[u8; 32]> = transactions
        .iter()
        .flat_map(Transaction::non_zero_commitments)
        .map(H256::to_fixed_bytes)
        .collect();
    let next = state
        .append(&commitments)
        .map_err(|err| BlockCheckError::Internal(err.into()))?;
    let computed = H256::from(next.root());
    if computed != block.root() {
        return Err(BlockError::RootMismatch {
            computed,
            declared: block.root(),
        }
        .into());
    }
    Ok(())
}

async fn check_leaf_count(block: &Block, storage: &dyn Storage) -> Result<(), BlockCheckError> {
    let expected = if block.block_number_l2() == 0 {
        0
    } else {
        let prior = storage
            .block_by_number(block.block_number_l2() - 1)
            .await?
            .ok_or_else(|| {
                BlockCheckError::Internal(eyre!(
                    "prior block {} is not stored; block cannot be checked",
                    block.block_number_l2() - 1
                ))
            })?;
        prior.block.leaf_count() + prior.block.n_commitments()
    };
    if block.leaf_count() != expected {
        return Err(BlockError::LeafCountMismatch {
            declared: block.leaf_count(),
            expected,
        }
        .into());
    }
    Ok(())
}

async fn check_duplicate_submission(
    block: &Block,
    transactions: &[Transaction],
    storage: &dyn Storage,
) -> Result<(), BlockCheckError> {
    // within the block itself: the calldata is proposer-controlled, so a
    // hash (or a commitment) may legitimately appear twice in one block's
    // list; the challenge then names the same block on both sides
    let mut seen_hashes: HashMap<H256, usize> = HashMap::new();
    let mut seen_commitments: HashMap<H256, usize> = HashMap::new();
    for (index, transaction) in transactions.iter().enumerate() {
        let transaction_hash = block.transaction_hashes()[index];
        if seen_hashes.insert(transaction_hash, index).is_some() {
            return Err(BlockError::DuplicateTransaction {
                transaction_hash,
                index,
                other_block_hash: block.block_hash(),
            }
            .into());
        }
        for commitment in transaction.non_zero_commitments() {
            if let Some(first_index) = seen_commitments.insert(commitment, index) {
                // name the earlier holder of the commitment so the
                // challenge pairs two distinct positions
                return Err(BlockError::DuplicateTransaction {
                    transaction_hash: block.transaction_hashes()[first_index],
                    index,
                    other_block_hash: block.block_hash(),
                }
                .into());
            }
        }
    }

    // against blocks stored earlier
    for (index, transaction_hash) in block.transaction_hashes().iter().enumerate() {
        let Some(other) = storage.block_containing_transaction(*transaction_hash).await? else {
            continue;
        };
        if other.block.block_hash() != block.block_hash() {
            return Err(BlockError::DuplicateTransaction {
                transaction_hash: *transaction_hash,
                index,
                other_block_hash: other.block.block_hash(),
            }
            .into());
        }
    }
    Ok(())
}

async fn check_nullifiers(
    block: &Block,
    transactions: &[Transaction],
    storage: &dyn Storage,
) -> Result<(), BlockCheckError> {
    // against still-live stored blocks
    for (index, transaction) in transactions.iter().enumerate() {
        for nullifier in transaction.non_zero_nullifiers() {
            let Some(other_block_hash) = storage.mined_block_of_nullifier(nullifier).await? else {
                continue;
            };
            if other_block_hash != block.block_hash() {
                return Err(BlockError::DuplicateNullifier {
                    nullifier,
                    index,
                    other_block_hash,
                }
                .into());
            }
        }
    }

    // within the block itself
    let mut seen: HashMap<H256, usize> = HashMap::new();
    for (index, transaction) in transactions.iter().enumerate() {
        for nullifier in transaction.non_zero_nullifiers() {
            if let Some(first_index) = seen.get(&nullifier) {
                return Err(BlockError::DuplicateNullifierInBlock {
                    nullifier,
                    first_index: *first_index,
                    second_index: index,
                }
                .into());
            }
            seen.insert(nullifier, index);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ethers::types::{
        Address,
        U256,
    };
    use willow_core::{
        transaction::TransactionType,
        Proof,
        TransactionBuilder,
    };
    use willow_merkle::TreeState;

    use super::*;
    use crate::{
        assembler::build_block,
        orchestrator::EventNotification,
        storage::InMemoryStorage,
        verifier::{
            PermissiveVerifier,
            VerificationKey,
        },
    };

    struct StaticLedger;

    #[async_trait]
    impl Ledger for StaticLedger {
        async fn block_count_l2(&self) -> eyre::Result<u64> {
            Ok(0)
        }

        async fn current_proposer(&self) -> eyre::Result<Address> {
            Ok(Address::zero())
        }

        async fn verification_key(
            &self,
            _transaction_type: TransactionType,
        ) -> eyre::Result<VerificationKey> {
            Ok(VerificationKey::default())
        }

        async fn latest_l1_block(&self) -> eyre::Result<u64> {
            Ok(0)
        }

        async fn events_in_range(
            &self,
            _from: u64,
            _to: u64,
        ) -> eyre::Result<Vec<EventNotification>> {
            Ok(Vec::new())
        }
    }

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

    fn deposit(commitment: u8) -> Transaction {
        TransactionBuilder::new(TransactionType::Deposit, valid_proof())
            .value(U256::from(10))
            .erc_address(word(0xaa))
            .commitments(vec![word(commitment)])
            .build()
    }

    fn withdraw_spending(nullifier: u8) -> Transaction {
        TransactionBuilder::new(TransactionType::Withdraw, valid_proof())
            .value(U256::from(5))
            .erc_address(word(0xaa))
            .recipient_address(word(0xbb))
            .nullifiers(vec![word(nullifier)])
            .historic_root_block_numbers(vec![0])
            .build()
    }

    async fn check(
        block: &Block,
        transactions: &[Transaction],
        storage: &InMemoryStorage,
    ) -> Result<(), BlockCheckError> {
        check_block(block, transactions, storage, &PermissiveVerifier, &StaticLedger).await
    }

    fn invalid_code(result: Result<(), BlockCheckError>) -> u8 {
        match result {
            Err(BlockCheckError::Invalid(err)) => err.code(),
            other => panic!("expected an invalid block, got {other:?}"),
        }
    }

    /// Stores a genesis block plus its tree snapshot so later blocks have
    /// a prior block to chain from; returns its post-state.
    async fn seed_genesis(storage: &InMemoryStorage) -> TreeState {
        let transactions = vec![deposit(0x01)];
        let (block, state) =
            build_block(Address::repeat_byte(1), &transactions, &TreeState::empty(), 0).unwrap();
        storage.save_block(&block, 10).await.unwrap();
        storage.save_tree_state(&state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn well_formed_block_passes() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        let transactions = vec![deposit(0x02), withdraw_spending(0x21)];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &state, 1).unwrap();
        check(&block, &transactions, &storage).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_root_fails_with_code_zero() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        let transactions = vec![deposit(0x02)];
        let bad = Block::new(
            Address::repeat_byte(1),
            word(0xde),
            state.leaf_count(),
            1,
            &transactions,
        );
        assert_eq!(0, invalid_code(check(&bad, &transactions, &storage).await));
    }

    #[tokio::test]
    async fn leaf_count_gap_fails_with_code_seven() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        // claims 3 leaves while the genesis block only produced 1
        let wrong_base = TreeState::empty().append(&[[9; 32], [8; 32], [7; 32]]).unwrap();
        storage.save_tree_state(&wrong_base).await.unwrap();
        let transactions = vec![deposit(0x02)];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &wrong_base, 1).unwrap();
        assert_ne!(wrong_base.leaf_count(), state.leaf_count());
        assert_eq!(7, invalid_code(check(&block, &transactions, &storage).await));
    }

    #[tokio::test]
    async fn fabricated_leaf_count_fails_with_code_seven() {
        let storage = InMemoryStorage::new();
        seed_genesis(&storage).await;
        // no snapshot exists anywhere near the claimed count; the check
        // must still produce a challengeable error, not an internal one
        let transactions = vec![deposit(0x02)];
        let block = Block::new(Address::repeat_byte(1), word(0xde), 57, 1, &transactions);
        assert_eq!(7, invalid_code(check(&block, &transactions, &storage).await));
    }

    #[tokio::test]
    async fn repeated_transaction_within_the_block_fails_with_code_one() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        // same deposit listed twice; the root is honestly computed over
        // the doubled commitments, so only the duplicate scan catches it
        let transactions = vec![deposit(0x02), deposit(0x02)];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &state, 1).unwrap();
        match check(&block, &transactions, &storage).await {
            Err(BlockCheckError::Invalid(BlockError::DuplicateTransaction {
                index,
                other_block_hash,
                ..
            })) => {
                assert_eq!(1, index);
                assert_eq!(block.block_hash(), other_block_hash);
            }
            other => panic!("expected a duplicate transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubmitted_transaction_fails_with_code_one() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        let duplicate = deposit(0x01);
        let transactions = vec![duplicate];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &state, 1).unwrap();
        assert_eq!(1, invalid_code(check(&block, &transactions, &storage).await));
    }

    #[tokio::test]
    async fn nullifier_spent_in_a_live_block_fails_with_code_five() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;

        let first_spend = vec![withdraw_spending(0x21)];
        let (first_block, first_state) =
            build_block(Address::repeat_byte(1), &first_spend, &state, 1).unwrap();
        storage.save_block(&first_block, 11).await.unwrap();
        storage.save_tree_state(&first_state).await.unwrap();
        storage
            .mark_nullifiers_mined(&[word(0x21)], first_block.block_hash())
            .await
            .unwrap();

        // distinct transaction (different value) spending the same nullifier,
        // so the duplicate-submission check does not fire first
        let second_spender = TransactionBuilder::new(TransactionType::Withdraw, valid_proof())
            .value(U256::from(6))
            .erc_address(word(0xaa))
            .recipient_address(word(0xbb))
            .nullifiers(vec![word(0x21)])
            .historic_root_block_numbers(vec![0])
            .build();
        let second_spend = vec![deposit(0x05), second_spender];
        let (second_block, _) =
            build_block(Address::repeat_byte(2), &second_spend, &first_state, 2).unwrap();

        let result = check(&second_block, &second_spend, &storage).await;
        match result {
            Err(BlockCheckError::Invalid(BlockError::DuplicateNullifier {
                nullifier,
                index,
                other_block_hash,
            })) => {
                assert_eq!(word(0x21), nullifier);
                assert_eq!(1, index);
                assert_eq!(first_block.block_hash(), other_block_hash);
            }
            other => panic!("expected a duplicate nullifier, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nullifier_reused_within_the_block_fails_with_code_six() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        // identical transactions would share a hash, so the second spender
        // differs in value while reusing the nullifier
        let transactions = vec![
            withdraw_spending(0x21),
            TransactionBuilder::new(TransactionType::Withdraw, valid_proof())
                .value(U256::from(6))
                .erc_address(word(0xaa))
                .recipient_address(word(0xbb))
                .nullifiers(vec![word(0x21)])
                .historic_root_block_numbers(vec![0])
                .build(),
        ];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &state, 1).unwrap();
        assert_eq!(6, invalid_code(check(&block, &transactions, &storage).await));
    }

    #[tokio::test]
    async fn invalid_transaction_type_is_remapped_to_code_two() {
        let storage = InMemoryStorage::new();
        let state = seed_genesis(&storage).await;
        // a deposit carrying a nullifier violates the type table
        let malformed = TransactionBuilder::new(TransactionType::Deposit, valid_proof())
            .value(U256::from(10))
            .erc_address(word(0xaa))
            .commitments(vec![word(0x02)])
            .nullifiers(vec![word(0x44)])
            .build();
        let transactions = vec![malformed];
        let (block, _) =
            build_block(Address::repeat_byte(1), &transactions, &state, 1).unwrap();
        assert_eq!(2, invalid_code(check(&block, &transactions, &storage).await));
    }
}
