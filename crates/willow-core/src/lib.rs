//! Domain types for the willow rollup: blocks, private-state transactions,
//! their canonical on-chain encoding and hashing, and the closed error
//! taxonomies the fraud-proof protocol is keyed to.
//!
//! Everything downstream depends on [`Transaction`] and [`Block`] hashing
//! being bit-exact with the ledger contracts: the encoding is the contracts'
//! ABI tuple layout, field for field, with proofs carried in compressed form
//! inside any hash preimage.

pub mod block;
pub mod error;
pub mod proof;
pub mod transaction;

pub use block::Block;
pub use error::{
    BlockError,
    TransactionError,
};
pub use proof::{
    CompressedProof,
    Proof,
};
pub use transaction::{
    Transaction,
    TransactionBuilder,
    TransactionType,
};

/// Errors in the wire codec itself (malformed calldata, invalid curve
/// points). These are never validity failures: a codec error aborts the
/// current operation instead of driving a challenge.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode abi-encoded calldata")]
    Abi(#[from] ethers::abi::Error),
    #[error("calldata decoded to an unexpected token shape")]
    TokenShape,
    #[error("unknown transaction type {0}")]
    UnknownTransactionType(u64),
    #[error(transparent)]
    Curve(#[from] proof::CurveError),
}
