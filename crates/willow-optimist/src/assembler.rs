//! Block assembly for the active proposer.
//!
//! The assembler polls the mempool and, when this node is the current
//! proposer with a full batch of profitable transactions, builds the next
//! L2 block and hands its `propose_block` calldata to the signer.
//!
//! The ledger's view of the leaf count lags behind blocks this node has
//! assembled but not yet seen confirmed, so the assembler keeps a local
//! tree cache. While the cache is ahead of the store it is authoritative;
//! any rollback signal must reset it before the next assembly or the next
//! root would be computed against stale state.

use std::{
    sync::Arc,
    time::Duration,
};

use ethers::types::{
    Address,
    H256,
};
use eyre::{
    Result,
    WrapErr as _,
};
use tokio::{
    select,
    sync::Mutex,
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};
use willow_core::{
    block::encode_calldata,
    Block,
    Transaction,
};
use willow_merkle::TreeState;

use crate::{
    signer,
    signer::SignerMessage,
    state::SharedState,
    storage::Storage,
};

/// The assembler's view of the commitment tree relative to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTree {
    /// No unconfirmed blocks outstanding; the store is authoritative.
    InSyncWithStore,
    /// This node assembled blocks the store has not yet seen confirmed.
    AheadOfStore {
        tree: TreeState,
        next_block_number: u64,
    },
}

/// Shared handle to the local tree cache. The orchestrator resets it on
/// rollback and proposer-change events while the assembler advances it.
#[derive(Debug, Clone)]
pub struct TreeCache {
    inner: Arc<Mutex<LocalTree>>,
}

impl TreeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LocalTree::InSyncWithStore)),
        }
    }

    pub async fn current(&self) -> LocalTree {
        self.inner.lock().await.clone()
    }

    pub async fn advance(&self, tree: TreeState, next_block_number: u64) {
        *self.inner.lock().await = LocalTree::AheadOfStore {
            tree,
            next_block_number,
        };
    }

    /// Forgets everything assembled but unconfirmed. Must run before the
    /// next assembly after any rollback.
    pub async fn reset(&self) {
        *self.inner.lock().await = LocalTree::InSyncWithStore;
    }
}

impl Default for TreeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a block over `transactions` on top of `tree_state`, returning
/// the block and the advanced tree state.
///
/// # Errors
/// Returns an error if the batch's commitments would overfill the tree.
pub fn build_block(
    proposer: Address,
    transactions: &[Transaction],
    tree_state: &TreeState,
    block_number_l2: u64,
) -> Result<(Block, TreeState)> {
    let commitments: Vec<[u8; 32]> = transactions
        .iter()
        .flat_map(Transaction::non_zero_commitments)
        .map(H256::to_fixed_bytes)
        .collect();
    let next = tree_state
        .append(&commitments)
        .wrap_err("batch does not fit in the commitment tree")?;
    let block = Block::new(
        proposer,
        H256::from(next.root()),
        tree_state.leaf_count(),
        block_number_l2,
        transactions,
    );
    Ok((block, next))
}

pub struct Builder {
    pub storage: Arc<dyn Storage>,
    pub signer: signer::Handle,
    pub state: Arc<SharedState>,
    pub cache: TreeCache,
    pub transactions_per_block: usize,
    pub assembly_interval: Duration,
    pub shutdown_token: CancellationToken,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> BlockAssembler {
        let Self {
            storage,
            signer,
            state,
            cache,
            transactions_per_block,
            assembly_interval,
            shutdown_token,
        } = self;
        BlockAssembler {
            storage,
            signer,
            state,
            cache,
            transactions_per_block,
            assembly_interval,
            shutdown_token,
        }
    }
}

pub struct BlockAssembler {
    storage: Arc<dyn Storage>,
    signer: signer::Handle,
    state: Arc<SharedState>,
    cache: TreeCache,
    transactions_per_block: usize,
    assembly_interval: Duration,
    shutdown_token: CancellationToken,
}

impl BlockAssembler {
    pub async fn run(self) -> Result<()> {
        let mut ticker = interval(self.assembly_interval);
        loop {
            select! {
                () = self.shutdown_token.cancelled() => {
                    info!("block assembler shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.try_assemble()
                        .await
                        .wrap_err("block assembly failed")?;
                }
            }
        }
    }

    #[instrument(skip_all)]
    async fn try_assemble(&self) -> Result<()> {
        if !self.state.proposer().await.is_me {
            return Ok(());
        }
        if self.state.stop_marker_pending() {
            debug!("assembly halted while a bad block awaits rollback");
            return Ok(());
        }

        let transactions = self
            .storage
            .most_profitable_transactions(self.transactions_per_block)
            .await
            .wrap_err("failed to read the mempool")?;
        let force = self.state.force_assembly_requested();
        if transactions.is_empty() || (transactions.len() < self.transactions_per_block && !force)
        {
            return Ok(());
        }
        self.state.take_force_assembly();

        let (tree_state, block_number_l2) = self
            .base_tree_state()
            .await
            .wrap_err("failed to determine the base tree state")?;
        let proposer = self.state.node_address();
        let (block, next_state) =
            build_block(proposer, &transactions, &tree_state, block_number_l2)?;

        let calldata = encode_calldata(&block, &transactions);
        self.signer
            .send(SignerMessage::ProposeBlock {
                block_hash: block.block_hash(),
                calldata,
            })
            .await
            .wrap_err("signer is gone")?;

        for transaction in &transactions {
            self.storage
                .set_in_mempool(transaction.transaction_hash(), false)
                .await
                .wrap_err("failed to remove a used transaction from the mempool")?;
        }
        self.cache.advance(next_state, block_number_l2 + 1).await;

        info!(
            block_hash = %block.block_hash(),
            block_number_l2,
            transactions = transactions.len(),
            "assembled and submitted a block"
        );
        Ok(())
    }

    /// The tree state and L2 number the next block builds on: the local
    /// cache when it is ahead of the store, the stored chain tip otherwise.
    async fn base_tree_state(&self) -> Result<(TreeState, u64)> {
        if let LocalTree::AheadOfStore {
            tree,
            next_block_number,
        } = self.cache.current().await
        {
            return Ok((tree, next_block_number));
        }

        let blocks = self
            .storage
            .blocks_in_order()
            .await
            .wrap_err("failed to list stored blocks")?;
        let Some(tip) = blocks.last() else {
            return Ok((TreeState::empty(), 0));
        };
        let leaf_count = tip.block.leaf_count() + tip.block.n_commitments();
        let state = self
            .storage
            .tree_state_by_leaf_count(leaf_count)
            .await
            .wrap_err("failed to load the tip tree snapshot")?;
        let Some(state) = state else {
            warn!(
                leaf_count,
                "tip tree snapshot missing; falling back to the empty tree"
            );
            return Ok((TreeState::empty(), blocks.len() as u64));
        };
        Ok((state, blocks.len() as u64))
    }
}
