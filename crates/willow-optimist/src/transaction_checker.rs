//! Validity checks for a single transaction.
//!
//! Five checks, in order: carried hash, per-type field consistency,
//! historic root existence, public-input overflow, proof verification.
//! A failed check is expected control flow and surfaces as
//! [`TransactionError`]; storage or verifier transport faults are fatal
//! and must never be mistaken for invalidity.

use ethers::types::{
    H256,
    U256,
};
use willow_core::{
    proof::is_scalar_field_element,
    transaction::{
        Transaction,
        TransactionType,
        ARITY,
    },
    TransactionError,
};

use crate::{
    ledger::Ledger,
    storage::{
        Storage,
        StorageError,
    },
    verifier::{
        ProofVerifier,
        VerifierUnavailable,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// The transaction is invalid; drives rejection or a challenge.
    #[error(transparent)]
    Invalid(#[from] TransactionError),
    /// The check itself could not run; aborts the current operation.
    #[error("{0}")]
    Internal(eyre::Report),
}

impl From<StorageError> for CheckError {
    fn from(err: StorageError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<VerifierUnavailable> for CheckError {
    fn from(err: VerifierUnavailable) -> Self {
        Self::Internal(err.into())
    }
}

/// # Errors
/// `CheckError::Invalid` when the transaction fails a validity rule,
/// `CheckError::Internal` when storage or the verifier is unavailable.
pub async fn check_transaction(
    transaction: &Transaction,
    storage: &dyn Storage,
    verifier: &dyn ProofVerifier,
    ledger: &dyn Ledger,
) -> Result<(), CheckError> {
    let transaction_hash = transaction.transaction_hash();

    if !transaction.check_hash() {
        return Err(TransactionError::HashMismatch {
            transaction_hash,
        }
        .into());
    }

    if !type_consistent(transaction) {
        return Err(TransactionError::TypeInconsistent {
            transaction_hash,
            transaction_type: transaction.transaction_type(),
        }
        .into());
    }

    let historic_roots = resolve_historic_roots(transaction, storage).await?;

    let public_inputs = transaction.public_inputs(&historic_roots);
    if let Some(overflowing) = public_inputs
        .iter()
        .find(|input| !is_scalar_field_element(**input))
    {
        return Err(TransactionError::PublicInputOverflow {
            transaction_hash,
            input: *overflowing,
        }
        .into());
    }

    let key = ledger
        .verification_key(transaction.transaction_type())
        .await
        .map_err(CheckError::Internal)?;
    let valid = verifier
        .verify(&key, transaction.proof(), &public_inputs)
        .await?;
    if !valid {
        return Err(TransactionError::ProofVerificationFailed {
            transaction_hash,
        }
        .into());
    }
    Ok(())
}

/// How many leading historic-root slots a transaction type reads.
fn referenced_roots(transaction_type: TransactionType) -> usize {
    match transaction_type {
        TransactionType::Deposit => 0,
        TransactionType::SingleTransfer | TransactionType::Withdraw => 1,
        TransactionType::DoubleTransfer => ARITY,
    }
}

async fn resolve_historic_roots(
    transaction: &Transaction,
    storage: &dyn Storage,
) -> Result<[H256; ARITY], CheckError> {
    let mut roots = [H256::zero(); ARITY];
    let referenced = referenced_roots(transaction.transaction_type());
    for (slot, block_number) in transaction
        .historic_root_block_numbers()
        .iter()
        .take(referenced)
        .enumerate()
    {
        let stored = storage.block_by_number(*block_number).await?;
        let Some(stored) = stored else {
            return Err(TransactionError::HistoricRootMissing {
                transaction_hash: transaction.transaction_hash(),
                block_number_l2: *block_number,
            }
            .into());
        };
        roots[slot] = stored.block.root();
    }
    Ok(roots)
}

/// The per-type zero/non-zero pattern every field must match.
fn type_consistent(transaction: &Transaction) -> bool {
    let zero = H256::zero();
    let commitments = transaction.commitments();
    let nullifiers = transaction.nullifiers();
    let secrets = transaction.compressed_secrets();
    let no_historic_reference = transaction
        .historic_root_block_numbers()
        .iter()
        .all(|n| *n == 0);
    match transaction.transaction_type() {
        TransactionType::Deposit => {
            transaction.value() != U256::zero()
                && transaction.erc_address() != zero
                && transaction.recipient_address() == zero
                && commitments[0] != zero
                && commitments[1] == zero
                && nullifiers.iter().all(|n| *n == zero)
                && secrets.iter().all(|s| *s == zero)
                && no_historic_reference
        }
        TransactionType::SingleTransfer => {
            transaction.value() == U256::zero()
                && transaction.token_id() == U256::zero()
                && transaction.erc_address() == zero
                && transaction.recipient_address() == zero
                && commitments[0] != zero
                && commitments[1] == zero
                && nullifiers[0] != zero
                && nullifiers[1] == zero
                && secrets.iter().any(|s| *s != zero)
        }
        TransactionType::DoubleTransfer => {
            transaction.value() == U256::zero()
                && transaction.token_id() == U256::zero()
                && transaction.erc_address() == zero
                && transaction.recipient_address() == zero
                && commitments.iter().all(|c| *c != zero)
                && nullifiers.iter().all(|n| *n != zero)
                && secrets.iter().any(|s| *s != zero)
        }
        TransactionType::Withdraw => {
            transaction.value() != U256::zero()
                && transaction.erc_address() != zero
                && transaction.recipient_address() != zero
                && commitments.iter().all(|c| *c == zero)
                && nullifiers[0] != zero
                && nullifiers[1] == zero
                && secrets.iter().all(|s| *s == zero)
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ethers::types::Address;
    use willow_core::{
        Block,
        Proof,
        TransactionBuilder,
    };

    use super::*;
    use crate::{
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

    struct RejectingVerifier;

    #[async_trait]
    impl ProofVerifier for RejectingVerifier {
        async fn verify(
            &self,
            _key: &VerificationKey,
            _proof: &Proof,
            _public_inputs: &[U256],
        ) -> Result<bool, VerifierUnavailable> {
            Ok(false)
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

    fn deposit() -> TransactionBuilder {
        TransactionBuilder::new(TransactionType::Deposit, valid_proof())
            .value(U256::from(10))
            .erc_address(word(0xaa))
            .commitments(vec![word(0x11)])
    }

    fn single_transfer() -> TransactionBuilder {
        TransactionBuilder::new(TransactionType::SingleTransfer, valid_proof())
            .commitments(vec![word(0x11)])
            .nullifiers(vec![word(0x22)])
            .compressed_secrets(vec![word(0x33), word(0x34)])
            .historic_root_block_numbers(vec![0])
    }

    fn double_transfer() -> TransactionBuilder {
        TransactionBuilder::new(TransactionType::DoubleTransfer, valid_proof())
            .commitments(vec![word(0x11), word(0x12)])
            .nullifiers(vec![word(0x22), word(0x23)])
            .compressed_secrets(vec![word(0x33), word(0x34)])
            .historic_root_block_numbers(vec![0, 0])
    }

    fn withdraw() -> TransactionBuilder {
        TransactionBuilder::new(TransactionType::Withdraw, valid_proof())
            .value(U256::from(5))
            .erc_address(word(0xaa))
            .recipient_address(word(0xbb))
            .nullifiers(vec![word(0x22)])
            .historic_root_block_numbers(vec![0])
    }

    async fn storage_with_genesis_block() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        let block = Block::new(Address::repeat_byte(1), word(0xdd), 0, 0, &[]);
        storage.save_block(&block, 1).await.unwrap();
        storage
    }

    async fn check(
        transaction: &Transaction,
        storage: &InMemoryStorage,
    ) -> Result<(), CheckError> {
        check_transaction(transaction, storage, &PermissiveVerifier, &StaticLedger).await
    }

    fn invalid_code(result: Result<(), CheckError>) -> u8 {
        match result {
            Err(CheckError::Invalid(err)) => err.code(),
            other => panic!("expected an invalid transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn well_formed_transactions_of_every_type_pass() {
        let storage = storage_with_genesis_block().await;
        for builder in [deposit(), single_transfer(), double_transfer(), withdraw()] {
            let transaction = builder.build();
            check(&transaction, &storage)
                .await
                .unwrap_or_else(|err| panic!("{:?} failed: {err}", transaction.transaction_type()));
        }
    }

    #[tokio::test]
    async fn tampered_hash_fails_with_code_zero() {
        let storage = storage_with_genesis_block().await;
        let transaction = deposit().claimed_hash(word(0xff)).build();
        assert_eq!(0, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn deposit_with_a_nullifier_fails_the_type_table() {
        let storage = storage_with_genesis_block().await;
        let transaction = deposit().nullifiers(vec![word(0x22)]).build();
        assert_eq!(1, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn deposit_referencing_a_historic_root_fails_the_type_table() {
        let storage = storage_with_genesis_block().await;
        let transaction = deposit().historic_root_block_numbers(vec![3]).build();
        assert_eq!(1, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn transfer_with_a_visible_value_fails_the_type_table() {
        let storage = storage_with_genesis_block().await;
        let transaction = single_transfer().value(U256::from(1)).build();
        assert_eq!(1, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn double_transfer_with_one_nullifier_fails_the_type_table() {
        let storage = storage_with_genesis_block().await;
        let transaction = double_transfer().nullifiers(vec![word(0x22)]).build();
        assert_eq!(1, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn withdraw_with_a_commitment_fails_the_type_table() {
        let storage = storage_with_genesis_block().await;
        let transaction = withdraw().commitments(vec![word(0x11)]).build();
        assert_eq!(1, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn unknown_historic_block_fails_with_code_three() {
        let storage = storage_with_genesis_block().await;
        let transaction = withdraw().historic_root_block_numbers(vec![42]).build();
        assert_eq!(3, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn deposits_skip_the_historic_root_lookup() {
        // no blocks stored at all; a deposit must still pass
        let storage = InMemoryStorage::new();
        check(&deposit().build(), &storage).await.unwrap();
    }

    #[tokio::test]
    async fn overflowing_public_input_fails_with_code_four() {
        let storage = storage_with_genesis_block().await;
        let transaction = deposit().erc_address(H256::repeat_byte(0xff)).build();
        assert_eq!(4, invalid_code(check(&transaction, &storage).await));
    }

    #[tokio::test]
    async fn rejected_proof_fails_with_code_four() {
        let storage = storage_with_genesis_block().await;
        let transaction = deposit().build();
        let result =
            check_transaction(&transaction, &storage, &RejectingVerifier, &StaticLedger).await;
        assert_eq!(4, invalid_code(result));
    }
}
