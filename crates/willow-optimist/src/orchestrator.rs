//! Serialized application of L1 rollup events to local state.
//!
//! Events arrive over one channel and are applied strictly in order, so
//! same-kind handlers never interleave. Validity failures are expected
//! control flow and drive rejection or a challenge; anything else
//! (storage, codec, verifier transport) is logged and re-raised, since
//! guessing around an unrecognized failure could accept or reject a block
//! incorrectly.
//!
//! Reorgs surface as notifications with the `removed` flag. The removed
//! event's effect is undone, its L1 transaction hash joins a pending
//! removal set, and every event from that L1 block to the head is
//! re-fetched and re-applied ascending, skipping anything still in the
//! pending set. Replays run inline on this task, so at most one is ever in
//! flight.

use std::{
    collections::HashMap,
    sync::Arc,
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
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};
use willow_core::{
    block::decode_calldata,
    Block,
    Transaction,
};

use crate::{
    assembler::TreeCache,
    block_checker::{
        check_block,
        BlockCheckError,
    },
    challenges::ChallengeGenerator,
    ledger::Ledger,
    state::SharedState,
    storage::Storage,
    transaction_checker::{
        check_transaction,
        CheckError,
    },
    verifier::ProofVerifier,
};

/// A rollup contract event, carrying raw calldata where the payload is the
/// proposing transaction's input rather than log data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BlockProposed { calldata: Vec<u8> },
    Rollback { block_number_l2: u64 },
    NewCurrentProposer { proposer: Address },
    CommittedToChallenge { commit_hash: H256, sender: Address },
    TransactionSubmitted { calldata: Vec<u8> },
}

/// An [`Event`] with its L1 position. `removed` marks a log the chain
/// dropped in a reorg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    pub event: Event,
    pub l1_block: u64,
    pub l1_tx_index: u64,
    pub l1_tx_hash: H256,
    pub removed: bool,
}

pub struct Builder {
    pub storage: Arc<dyn Storage>,
    pub verifier: Arc<dyn ProofVerifier>,
    pub ledger: Arc<dyn Ledger>,
    pub challenges: ChallengeGenerator,
    pub state: Arc<SharedState>,
    pub cache: TreeCache,
    pub is_challenger: bool,
    pub events: mpsc::Receiver<EventNotification>,
    pub shutdown_token: CancellationToken,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let Self {
            storage,
            verifier,
            ledger,
            challenges,
            state,
            cache,
            is_challenger,
            events,
            shutdown_token,
        } = self;
        Orchestrator {
            storage,
            verifier,
            ledger,
            challenges,
            state,
            cache,
            is_challenger,
            events,
            shutdown_token,
            pending_removals: HashMap::new(),
        }
    }
}

pub struct Orchestrator {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) verifier: Arc<dyn ProofVerifier>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) challenges: ChallengeGenerator,
    pub(crate) state: Arc<SharedState>,
    pub(crate) cache: TreeCache,
    is_challenger: bool,
    events: mpsc::Receiver<EventNotification>,
    shutdown_token: CancellationToken,
    // per-hash removal counters, drained as the replay matches them
    pending_removals: HashMap<H256, u32>,
}

impl Orchestrator {
    pub async fn run(mut self) -> Result<()> {
        loop {
            select! {
                () = self.shutdown_token.cancelled() => {
                    info!("orchestrator shutting down");
                    return Ok(());
                }
                notification = self.events.recv() => {
                    let Some(notification) = notification else {
                        info!("event channel closed; orchestrator exiting");
                        return Ok(());
                    };
                    if notification.removed {
                        self.handle_removed(notification)
                            .await
                            .wrap_err("reorg replay failed")?;
                    } else {
                        self.apply(notification)
                            .await
                            .wrap_err("event handling failed")?;
                    }
                }
            }
        }
    }

    /// Applies one confirmed event. Public so state sync can drive
    /// historical events through the same code path.
    #[instrument(skip(self, notification), fields(
        l1_block = notification.l1_block,
        l1_tx_index = notification.l1_tx_index,
    ))]
    pub async fn apply(&mut self, notification: EventNotification) -> Result<()> {
        match notification.event {
            Event::BlockProposed { calldata } => {
                self.handle_block_proposed(&calldata, notification.l1_block)
                    .await
            }
            Event::Rollback { block_number_l2 } => self.handle_rollback(block_number_l2).await,
            Event::NewCurrentProposer { proposer } => {
                self.handle_new_current_proposer(proposer).await
            }
            Event::CommittedToChallenge {
                commit_hash,
                sender,
            } => self.handle_committed_to_challenge(commit_hash, sender).await,
            Event::TransactionSubmitted { calldata } => {
                self.handle_transaction_submitted(&calldata, notification.l1_tx_hash)
                    .await
            }
        }
    }

    /// Undoes a reorged-out event and replays the affected L1 range.
    pub async fn handle_removed(&mut self, notification: EventNotification) -> Result<()> {
        warn!(
            l1_block = notification.l1_block,
            l1_tx_hash = %notification.l1_tx_hash,
            "event removed by a chain reorg"
        );
        *self
            .pending_removals
            .entry(notification.l1_tx_hash)
            .or_insert(0) += 1;
        self.undo(&notification.event).await?;

        let from = notification.l1_block;
        let to = self
            .ledger
            .latest_l1_block()
            .await
            .wrap_err("failed to read the L1 head")?;
        let mut events = self
            .ledger
            .events_in_range(from, to)
            .await
            .wrap_err("failed to re-fetch events for replay")?;
        events.sort_by_key(|n| (n.l1_block, n.l1_tx_index));

        for event in events {
            if let Some(count) = self.pending_removals.get_mut(&event.l1_tx_hash) {
                *count -= 1;
                if *count == 0 {
                    self.pending_removals.remove(&event.l1_tx_hash);
                }
                debug!(l1_tx_hash = %event.l1_tx_hash, "skipping a removed event during replay");
                continue;
            }
            self.apply(event).await?;
        }

        // the canonical proposer may have changed across the reorg
        let proposer = self
            .ledger
            .current_proposer()
            .await
            .wrap_err("failed to re-read the current proposer")?;
        self.state.set_current_proposer(proposer).await;
        info!(from, to, "replayed events after a reorg");
        Ok(())
    }

    async fn undo(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::BlockProposed { calldata } => {
                let (block, _) =
                    decode_calldata(calldata).wrap_err("failed to decode the removed block")?;
                self.handle_rollback(block.block_number_l2()).await
            }
            Event::TransactionSubmitted { calldata } => {
                let transaction = Transaction::decode(calldata)
                    .wrap_err("failed to decode the removed transaction")?;
                let transaction_hash = transaction.transaction_hash();
                // a submission not mined into any stored L2 block stays
                // proposable; the canonical chain usually re-mines it, and
                // the replay skips that re-mine as already applied
                if self
                    .storage
                    .block_containing_transaction(transaction_hash)
                    .await
                    .wrap_err("failed to look up the removed transaction's block")?
                    .is_some()
                {
                    self.storage
                        .set_in_mempool(transaction_hash, false)
                        .await
                        .wrap_err("failed to drop the removed transaction from the mempool")?;
                }
                Ok(())
            }
            // replay itself restores anything these changed
            Event::Rollback { .. }
            | Event::NewCurrentProposer { .. }
            | Event::CommittedToChallenge { .. } => Ok(()),
        }
    }

    /// Persists a proposed block optimistically, then checks it. The local
    /// record must always mirror what the chain holds; only a later
    /// rollback event removes it again.
    async fn handle_block_proposed(&mut self, calldata: &[u8], l1_block: u64) -> Result<()> {
        let (block, transactions) =
            decode_calldata(calldata).wrap_err("failed to decode proposed block calldata")?;
        info!(
            block_hash = %block.block_hash(),
            block_number_l2 = block.block_number_l2(),
            transactions = transactions.len(),
            "block proposed"
        );

        self.persist_block(&block, &transactions, l1_block).await?;

        if self.state.stop_marker_pending() {
            info!("skipping the validity check; a prior bad block awaits rollback");
            return Ok(());
        }

        match check_block(
            &block,
            &transactions,
            self.storage.as_ref(),
            self.verifier.as_ref(),
            self.ledger.as_ref(),
        )
        .await
        {
            Ok(()) => {
                debug!(block_hash = %block.block_hash(), "block checked clean");
                Ok(())
            }
            Err(BlockCheckError::Invalid(err)) => {
                warn!(
                    block_hash = %block.block_hash(),
                    code = err.code(),
                    %err,
                    "bad block detected; halting block production"
                );
                self.state.set_stop_marker(true);
                if self.is_challenger {
                    self.challenges
                        .handle_bad_block(&block, &transactions, &err)
                        .await
                        .wrap_err("challenge path failed")?;
                }
                Ok(())
            }
            Err(BlockCheckError::Internal(report)) => Err(report),
        }
    }

    async fn persist_block(
        &mut self,
        block: &Block,
        transactions: &[Transaction],
        l1_block: u64,
    ) -> Result<()> {
        self.storage
            .save_block(block, l1_block)
            .await
            .wrap_err("failed to persist the proposed block")?;

        let mut nullifiers = Vec::new();
        for transaction in transactions {
            // overwriting also drops the transaction from the mempool
            self.storage
                .save_transaction(transaction, false)
                .await
                .wrap_err("failed to persist a block transaction")?;
            nullifiers.extend(transaction.non_zero_nullifiers());
        }
        self.storage
            .mark_nullifiers_mined(&nullifiers, block.block_hash())
            .await
            .wrap_err("failed to stamp the block's nullifiers")?;

        let state = self
            .storage
            .tree_state_by_leaf_count(block.leaf_count())
            .await
            .wrap_err("failed to load the tree snapshot")?;
        match state {
            Some(state) => {
                let commitments: Vec<[u8; 32]> = transactions
                    .iter()
                    .flat_map(Transaction::non_zero_commitments)
                    .map(H256::to_fixed_bytes)
                    .collect();
                let next = state
                    .append(&commitments)
                    .wrap_err("block commitments do not fit in the tree")?;
                self.storage
                    .save_tree_state(&next)
                    .await
                    .wrap_err("failed to persist the tree snapshot")?;
            }
            None => {
                warn!(
                    leaf_count = block.leaf_count(),
                    "no tree snapshot at the block's leaf count; state sync required"
                );
            }
        }
        Ok(())
    }

    /// Unwinds every stored block at or above the rolled-back number.
    async fn handle_rollback(&mut self, block_number_l2: u64) -> Result<()> {
        info!(block_number_l2, "rolling back");
        let deleted = self
            .storage
            .delete_blocks_from(block_number_l2)
            .await
            .wrap_err("failed to delete rolled-back blocks")?;

        for stored in &deleted {
            self.storage
                .return_to_mempool(stored.block.transaction_hashes())
                .await
                .wrap_err("failed to return rolled-back transactions to the mempool")?;
            self.storage
                .unmark_nullifiers(stored.block.block_hash())
                .await
                .wrap_err("failed to unmark rolled-back nullifiers")?;
        }

        // deleted is newest-first; the last entry marks the restore point
        if let Some(oldest) = deleted.last() {
            self.storage
                .delete_tree_states_after(oldest.block.leaf_count())
                .await
                .wrap_err("failed to prune tree snapshots")?;
        }

        self.cache.reset().await;
        self.state.set_stop_marker(false);
        info!(blocks = deleted.len(), "rollback complete");
        Ok(())
    }

    async fn handle_new_current_proposer(&mut self, proposer: Address) -> Result<()> {
        let outgoing = self.state.set_current_proposer(proposer).await;
        let incoming = self.state.proposer().await;
        let known_registrants = self.state.known_registrants().await;
        info!(
            %proposer,
            is_me = incoming.is_me,
            known_registrants,
            "current proposer changed"
        );

        if !outgoing.is_me && incoming.is_me {
            // flush whatever queued while another node held the slot,
            // full batch or not
            self.state.request_block_assembly();
        }
        if outgoing.is_me && !incoming.is_me {
            // blocks assembled but never proposed will not be mined now;
            // their transactions must become proposable again
            self.cache.reset().await;
            let stranded = self
                .storage
                .stranded_transactions()
                .await
                .wrap_err("failed to list stranded transactions")?;
            if !stranded.is_empty() {
                info!(
                    count = stranded.len(),
                    "requeueing transactions stranded by the proposer change"
                );
                self.storage
                    .return_to_mempool(&stranded)
                    .await
                    .wrap_err("failed to requeue stranded transactions")?;
            }
        }
        Ok(())
    }

    async fn handle_committed_to_challenge(
        &mut self,
        commit_hash: H256,
        sender: Address,
    ) -> Result<()> {
        if sender != self.state.node_address() {
            return Ok(());
        }
        self.challenges.reveal(commit_hash).await
    }

    /// Admits a submitted transaction to the mempool, or drops it with the
    /// reason logged. A dropped transaction is expected control flow.
    async fn handle_transaction_submitted(
        &mut self,
        calldata: &[u8],
        l1_tx_hash: H256,
    ) -> Result<()> {
        let transaction = Transaction::decode(calldata)
            .wrap_err("failed to decode submitted transaction calldata")?;
        let transaction_hash = transaction.transaction_hash();

        if let Some(stored) = self
            .storage
            .block_containing_transaction(transaction_hash)
            .await
            .wrap_err("failed to check for an earlier inclusion")?
        {
            warn!(
                %transaction_hash,
                block_number_l2 = stored.block.block_number_l2(),
                code = 6,
                "transaction was already processed in a block; dropping"
            );
            return Ok(());
        }
        if self
            .storage
            .transaction_by_hash(transaction_hash)
            .await
            .wrap_err("failed to check for an earlier submission")?
            .is_some()
        {
            // benign re-mine of a known transaction; keep one proposable copy
            debug!(%transaction_hash, "transaction already known; demoting the duplicate");
            self.storage
                .set_in_mempool(transaction_hash, false)
                .await
                .wrap_err("failed to demote the duplicate")?;
            return Ok(());
        }

        let previous = self
            .storage
            .record_payment_reference(l1_tx_hash, transaction_hash)
            .await
            .wrap_err("failed to record the payment reference")?;
        if previous.is_some_and(|bound| bound != transaction_hash) {
            warn!(
                %transaction_hash,
                payment_reference = %l1_tx_hash,
                code = 7,
                "payment reference is already bound to another transaction; dropping"
            );
            return Ok(());
        }

        match check_transaction(
            &transaction,
            self.storage.as_ref(),
            self.verifier.as_ref(),
            self.ledger.as_ref(),
        )
        .await
        {
            Ok(()) => {}
            Err(CheckError::Invalid(err)) => {
                warn!(%transaction_hash, code = err.code(), %err, "invalid transaction; dropping");
                return Ok(());
            }
            Err(CheckError::Internal(report)) => return Err(report),
        }

        for nullifier in transaction.non_zero_nullifiers() {
            if self
                .storage
                .is_nullifier_tracked(nullifier)
                .await
                .wrap_err("failed to check a nullifier")?
            {
                warn!(
                    %transaction_hash,
                    %nullifier,
                    "nullifier is already spent or queued; dropping"
                );
                return Ok(());
            }
        }
        self.storage
            .insert_nullifiers(&transaction.non_zero_nullifiers())
            .await
            .wrap_err("failed to track the transaction's nullifiers")?;

        self.storage
            .save_transaction(&transaction, true)
            .await
            .wrap_err("failed to admit the transaction to the mempool")?;
        info!(%transaction_hash, fee = %transaction.fee(), "transaction admitted to the mempool");
        Ok(())
    }
}
