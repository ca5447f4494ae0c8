//! Read-only view of the L1 rollup contract.
//!
//! Everything consensus-critical arrives through events; this seam covers
//! the handful of direct reads the node needs (registered state at startup,
//! ranged event refetch for sync and reorg replay).

use async_trait::async_trait;
use ethers::types::Address;
use eyre::Result;
use willow_core::transaction::TransactionType;

use crate::{
    orchestrator::EventNotification,
    verifier::VerificationKey,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Number of L2 blocks the contract has accepted.
    async fn block_count_l2(&self) -> Result<u64>;

    async fn current_proposer(&self) -> Result<Address>;

    async fn verification_key(&self, transaction_type: TransactionType)
        -> Result<VerificationKey>;

    async fn latest_l1_block(&self) -> Result<u64>;

    /// Every rollup event in L1 blocks `[from, to]`, ascending by
    /// `(l1_block, l1_tx_index)`.
    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<EventNotification>>;
}
