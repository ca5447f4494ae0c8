//! Validity failures for transactions and blocks.
//!
//! Both taxonomies carry a stable numeric code keyed to the ledger's
//! challenge functions, so the numbering must never be reshuffled. Each
//! variant carries the evidence its challenge construction needs, rather
//! than a generic metadata bag, so a missing field is a compile error.

use ethers::types::{
    H256,
    U256,
};

use crate::transaction::TransactionType;

/// Why a single transaction failed its validity check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// Code 0: the carried hash does not match the canonical encoding.
    #[error("transaction {transaction_hash:#x} carries a hash that does not match its contents")]
    HashMismatch { transaction_hash: H256 },

    /// Code 1: a field violates the zero/non-zero pattern its declared
    /// type requires.
    #[error(
        "transaction {transaction_hash:#x} has fields inconsistent with type \
         {transaction_type:?}"
    )]
    TypeInconsistent {
        transaction_hash: H256,
        transaction_type: TransactionType,
    },

    /// Code 2: the declared type is not one of the known four.
    #[error("transaction {transaction_hash:#x} declares unknown type {declared_type}")]
    UnknownType {
        transaction_hash: H256,
        declared_type: u64,
    },

    /// Code 3: a referenced historic root does not resolve to a stored block.
    #[error(
        "transaction {transaction_hash:#x} references historic block {block_number_l2} which \
         has no stored root"
    )]
    HistoricRootMissing {
        transaction_hash: H256,
        block_number_l2: u64,
    },

    /// Code 4: a public input exceeds the circuit field order, so its
    /// on-chain reduction would alias a smaller value.
    #[error("transaction {transaction_hash:#x} has public input {input} outside the field order")]
    PublicInputOverflow {
        transaction_hash: H256,
        input: U256,
    },

    /// Code 4: the proof does not verify against the type's key.
    #[error("transaction {transaction_hash:#x} failed proof verification")]
    ProofVerificationFailed { transaction_hash: H256 },

    /// Code 6: the transaction was already included in a proposed block.
    #[error(
        "transaction {transaction_hash:#x} was already processed in L2 block {block_number_l2}"
    )]
    AlreadyProcessed {
        transaction_hash: H256,
        block_number_l2: u64,
    },

    /// Code 7: the fee payment reference is missing or already spent.
    #[error("transaction {transaction_hash:#x} has a missing or duplicate payment reference")]
    PaymentReference { transaction_hash: H256 },
}

impl TransactionError {
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::HashMismatch { .. } => 0,
            Self::TypeInconsistent { .. } => 1,
            Self::UnknownType { .. } => 2,
            Self::HistoricRootMissing { .. } => 3,
            Self::PublicInputOverflow { .. } | Self::ProofVerificationFailed { .. } => 4,
            Self::AlreadyProcessed { .. } => 6,
            Self::PaymentReference { .. } => 7,
        }
    }

    #[must_use]
    pub fn transaction_hash(&self) -> H256 {
        match self {
            Self::HashMismatch { transaction_hash }
            | Self::TypeInconsistent { transaction_hash, .. }
            | Self::UnknownType { transaction_hash, .. }
            | Self::HistoricRootMissing { transaction_hash, .. }
            | Self::PublicInputOverflow { transaction_hash, .. }
            | Self::ProofVerificationFailed { transaction_hash }
            | Self::AlreadyProcessed { transaction_hash, .. }
            | Self::PaymentReference { transaction_hash } => *transaction_hash,
        }
    }
}

/// Why a proposed block failed its validity check. First failure wins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// Code 0: replaying the block's commitments over the tree state at
    /// its leaf count does not reproduce the declared root.
    #[error("block root {declared:#x} does not match locally computed root {computed:#x}")]
    RootMismatch { computed: H256, declared: H256 },

    /// Code 1: a transaction hash in this block is already part of
    /// another stored block.
    #[error(
        "transaction {transaction_hash:#x} at index {index} was already submitted in block \
         {other_block_hash:#x}"
    )]
    DuplicateTransaction {
        transaction_hash: H256,
        index: usize,
        other_block_hash: H256,
    },

    /// Code 2: a transaction's fields are inconsistent with its type.
    /// Distinct from [`TransactionError::TypeInconsistent`]'s code 1 so
    /// the ledger can tell "bad type inside a block" from "bad type on
    /// submission".
    #[error("transaction at index {index} has fields inconsistent with its declared type")]
    InvalidTransactionType { index: usize },

    /// Code 3: a transaction references a historic root that does not exist.
    #[error(
        "transaction at index {index} references historic block {block_number_l2} which has no \
         stored root"
    )]
    HistoricRootMissing {
        index: usize,
        block_number_l2: u64,
    },

    /// Code 4: a transaction's proof fails verification, or one of its
    /// public inputs overflows the field order.
    #[error("transaction at index {index} failed proof verification")]
    InvalidProof { index: usize },

    /// Code 5: a nullifier in this block was already spent by a
    /// still-live stored block.
    #[error(
        "nullifier {nullifier:#x} at transaction index {index} was already spent in block \
         {other_block_hash:#x}"
    )]
    DuplicateNullifier {
        nullifier: H256,
        index: usize,
        other_block_hash: H256,
    },

    /// Code 6: the same nullifier appears twice within this block. The
    /// ledger keys this to a separate challenge function, hence the
    /// distinct code.
    #[error(
        "nullifier {nullifier:#x} appears at transaction indices {first_index} and \
         {second_index} of the same block"
    )]
    DuplicateNullifierInBlock {
        nullifier: H256,
        first_index: usize,
        second_index: usize,
    },

    /// Code 7: the declared leaf count does not continue from the prior
    /// block's leaf count plus its commitments.
    #[error("block declares leaf count {declared} but the prior block ends at {expected}")]
    LeafCountMismatch { declared: u64, expected: u64 },
}

impl BlockError {
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::RootMismatch { .. } => 0,
            Self::DuplicateTransaction { .. } => 1,
            Self::InvalidTransactionType { .. } => 2,
            Self::HistoricRootMissing { .. } => 3,
            Self::InvalidProof { .. } => 4,
            Self::DuplicateNullifier { .. } => 5,
            Self::DuplicateNullifierInBlock { .. } => 6,
            Self::LeafCountMismatch { .. } => 7,
        }
    }

    /// Remaps a per-transaction failure into its block-context code,
    /// attaching the index of the offending transaction.
    ///
    /// Only the type, historic-root and proof failures survive the remap;
    /// the submission-time checks (hash, replay, payment reference) are
    /// the caller's responsibility before a transaction ever reaches a
    /// block.
    #[must_use]
    pub fn from_transaction_error(err: &TransactionError, index: usize) -> Self {
        match err {
            TransactionError::TypeInconsistent { .. }
            | TransactionError::UnknownType { .. }
            | TransactionError::HashMismatch { .. }
            | TransactionError::AlreadyProcessed { .. }
            | TransactionError::PaymentReference { .. } => Self::InvalidTransactionType { index },
            TransactionError::HistoricRootMissing {
                block_number_l2, ..
            } => Self::HistoricRootMissing {
                index,
                block_number_l2: *block_number_l2,
            },
            TransactionError::PublicInputOverflow { .. }
            | TransactionError::ProofVerificationFailed { .. } => Self::InvalidProof { index },
        }
    }
}
