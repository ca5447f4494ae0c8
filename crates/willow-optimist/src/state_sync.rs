//! Startup reconciliation between the local store and the ledger.
//!
//! After downtime the store may be missing blocks, or hold a run of blocks
//! with an internal gap from a partially-applied rollback. Sync finds the
//! first inconsistency, unwinds from there, and replays the L1 event
//! history through the orchestrator's regular handlers. Challenge
//! production pauses for the duration so historical bad blocks are not
//! re-challenged months late.

use eyre::{
    Result,
    WrapErr as _,
};
use tracing::{
    info,
    instrument,
};

use crate::{
    orchestrator::{
        Event,
        EventNotification,
        Orchestrator,
    },
    storage::StoredBlock,
};

/// Where to resume from, per [`find_resync_point`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncPoint {
    /// Local state is consistent with the ledger.
    InSync,
    /// The stored chain is a clean prefix; fetch from this L1 block on.
    MissingTail { from_l1: u64 },
    /// The stored chain breaks at this L2 number; unwind it first, then
    /// replay from the L1 block that proposed it.
    Discontinuity { first_bad_l2: u64, from_l1: u64 },
}

/// Detects the first numbering or `leaf_count + n_commitments` gap in the
/// stored chain, or a stored chain shorter than the ledger's.
fn find_resync_point(stored: &[StoredBlock], on_chain_count: u64, start_l1_block: u64) -> ResyncPoint {
    let mut expected_leaf_count = 0;
    for (index, entry) in stored.iter().enumerate() {
        let expected_number = index as u64;
        if entry.block.block_number_l2() != expected_number
            || entry.block.leaf_count() != expected_leaf_count
        {
            let from_l1 = if index == 0 {
                start_l1_block
            } else {
                entry.l1_block.min(stored[index - 1].l1_block + 1)
            };
            return ResyncPoint::Discontinuity {
                first_bad_l2: expected_number,
                from_l1,
            };
        }
        expected_leaf_count = entry.block.leaf_count() + entry.block.n_commitments();
    }
    if (stored.len() as u64) < on_chain_count {
        let from_l1 = stored
            .last()
            .map_or(start_l1_block, |entry| entry.l1_block + 1);
        return ResyncPoint::MissingTail {
            from_l1,
        };
    }
    ResyncPoint::InSync
}

/// Brings the local store up to date with the ledger, then re-derives the
/// proposer and re-enables challenges.
///
/// # Errors
/// Any storage or ledger failure aborts the sync; the node must not serve
/// from a store it could not reconcile.
#[instrument(skip_all)]
pub async fn synchronize(orchestrator: &mut Orchestrator, start_l1_block: u64) -> Result<()> {
    orchestrator.state.set_challenges_enabled(false);

    let stored = orchestrator
        .storage
        .blocks_in_order()
        .await
        .wrap_err("failed to list stored blocks")?;
    let on_chain_count = orchestrator
        .ledger
        .block_count_l2()
        .await
        .wrap_err("failed to read the on-chain block count")?;

    match find_resync_point(&stored, on_chain_count, start_l1_block) {
        ResyncPoint::InSync => {
            info!(blocks = stored.len(), "local state is in sync with the ledger");
        }
        ResyncPoint::MissingTail { from_l1 } => {
            info!(from_l1, "stored chain is behind the ledger; replaying the tail");
            replay_range(orchestrator, from_l1).await?;
        }
        ResyncPoint::Discontinuity {
            first_bad_l2,
            from_l1,
        } => {
            info!(
                first_bad_l2,
                from_l1, "stored chain has a gap; unwinding and replaying"
            );
            orchestrator
                .apply(synthetic_rollback(first_bad_l2))
                .await
                .wrap_err("failed to unwind the inconsistent suffix")?;
            replay_range(orchestrator, from_l1).await?;
        }
    }

    let proposer = orchestrator
        .ledger
        .current_proposer()
        .await
        .wrap_err("failed to read the current proposer")?;
    orchestrator.state.set_current_proposer(proposer).await;

    orchestrator
        .challenges
        .enable()
        .await
        .wrap_err("failed to re-enable challenges")?;
    Ok(())
}

async fn replay_range(orchestrator: &mut Orchestrator, from_l1: u64) -> Result<()> {
    let to = orchestrator
        .ledger
        .latest_l1_block()
        .await
        .wrap_err("failed to read the L1 head")?;
    let mut events = orchestrator
        .ledger
        .events_in_range(from_l1, to)
        .await
        .wrap_err("failed to fetch historical events")?;
    events.sort_by_key(|n| (n.l1_block, n.l1_tx_index));
    let count = events.len();
    for event in events {
        orchestrator
            .apply(event)
            .await
            .wrap_err("failed to apply a historical event")?;
    }
    info!(from_l1, to, count, "historical replay complete");
    Ok(())
}

/// A locally-generated rollback; not tied to any L1 transaction.
fn synthetic_rollback(block_number_l2: u64) -> EventNotification {
    EventNotification {
        event: Event::Rollback {
            block_number_l2,
        },
        l1_block: 0,
        l1_tx_index: 0,
        l1_tx_hash: ethers::types::H256::zero(),
        removed: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use ethers::types::{
        Address,
        H256,
        U256,
    };
    use tokio::sync::{
        mpsc,
        Mutex,
    };
    use tokio_util::sync::CancellationToken;
    use willow_core::{
        block::encode_calldata,
        transaction::TransactionType,
        Block,
        Proof,
        Transaction,
        TransactionBuilder,
    };
    use willow_merkle::TreeState;

    use super::*;
    use crate::{
        assembler::{
            build_block,
            TreeCache,
        },
        challenges::ChallengeGenerator,
        ledger::Ledger,
        orchestrator::Builder,
        signer,
        state::SharedState,
        storage::{
            InMemoryStorage,
            Storage,
        },
        verifier::{
            PermissiveVerifier,
            VerificationKey,
        },
    };

    #[derive(Default)]
    struct ScriptedLedger {
        events: Mutex<Vec<EventNotification>>,
        block_count_l2: u64,
        latest_l1_block: u64,
        current_proposer: Address,
    }

    #[async_trait]
    impl Ledger for ScriptedLedger {
        async fn block_count_l2(&self) -> Result<u64> {
            Ok(self.block_count_l2)
        }

        async fn current_proposer(&self) -> Result<Address> {
            Ok(self.current_proposer)
        }

        async fn verification_key(
            &self,
            _transaction_type: TransactionType,
        ) -> Result<VerificationKey> {
            Ok(VerificationKey::default())
        }

        async fn latest_l1_block(&self) -> Result<u64> {
            Ok(self.latest_l1_block)
        }

        async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<EventNotification>> {
            Ok(self
                .events
                .lock()
                .await
                .iter()
                .filter(|n| n.l1_block >= from && n.l1_block <= to)
                .cloned()
                .collect())
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

    fn propose(block: &Block, transactions: &[Transaction], l1_block: u64) -> EventNotification {
        EventNotification {
            event: Event::BlockProposed {
                calldata: encode_calldata(block, transactions),
            },
            l1_block,
            l1_tx_index: 0,
            l1_tx_hash: word(l1_block as u8),
            removed: false,
        }
    }

    fn orchestrator(
        storage: Arc<InMemoryStorage>,
        ledger: Arc<ScriptedLedger>,
    ) -> (Orchestrator, Arc<SharedState>) {
        let state = SharedState::new(Address::repeat_byte(0x42));
        let (signer_handle, _signer_rx) = signer::channel(16);
        let challenges =
            ChallengeGenerator::new(storage.clone(), signer_handle, state.clone());
        let (_events_tx, events_rx) = mpsc::channel(1);
        let orchestrator = Builder {
            storage,
            verifier: Arc::new(PermissiveVerifier),
            ledger,
            challenges,
            state: state.clone(),
            cache: TreeCache::new(),
            is_challenger: false,
            events: events_rx,
            shutdown_token: CancellationToken::new(),
        }
        .build();
        (orchestrator, state)
    }

    /// Two consecutive blocks and their proposal notifications.
    fn chain_of_two() -> (Vec<(Block, Vec<Transaction>)>, Vec<EventNotification>) {
        let first_batch = vec![deposit(0x01)];
        let (first, state) =
            build_block(Address::repeat_byte(1), &first_batch, &TreeState::empty(), 0).unwrap();
        let second_batch = vec![deposit(0x02)];
        let (second, _) =
            build_block(Address::repeat_byte(1), &second_batch, &state, 1).unwrap();
        let notifications = vec![propose(&first, &first_batch, 10), propose(&second, &second_batch, 11)];
        (
            vec![(first, first_batch), (second, second_batch)],
            notifications,
        )
    }

    #[tokio::test]
    async fn consistent_store_needs_no_replay() {
        let storage = Arc::new(InMemoryStorage::new());
        let (chain, _) = chain_of_two();
        let mut leaf_states = TreeState::empty();
        for (block, batch) in &chain {
            storage.save_block(block, 10).await.unwrap();
            let commitments: Vec<[u8; 32]> = batch
                .iter()
                .flat_map(Transaction::non_zero_commitments)
                .map(H256::to_fixed_bytes)
                .collect();
            leaf_states = leaf_states.append(&commitments).unwrap();
            storage.save_tree_state(&leaf_states).await.unwrap();
        }
        let ledger = Arc::new(ScriptedLedger {
            block_count_l2: 2,
            ..ScriptedLedger::default()
        });
        let (mut orchestrator, state) = orchestrator(storage.clone(), ledger);

        synchronize(&mut orchestrator, 0).await.unwrap();

        assert_eq!(2, storage.blocks_in_order().await.unwrap().len());
        assert!(state.challenges_enabled());
    }

    #[tokio::test]
    async fn missing_tail_is_replayed_from_the_ledger() {
        let storage = Arc::new(InMemoryStorage::new());
        let (chain, notifications) = chain_of_two();
        let ledger = Arc::new(ScriptedLedger {
            events: Mutex::new(notifications),
            block_count_l2: 2,
            latest_l1_block: 20,
            ..ScriptedLedger::default()
        });
        let (mut orchestrator, _state) = orchestrator(storage.clone(), ledger);

        synchronize(&mut orchestrator, 0).await.unwrap();

        let stored = storage.blocks_in_order().await.unwrap();
        assert_eq!(2, stored.len());
        assert_eq!(chain[1].0.block_hash(), stored[1].block.block_hash());
    }

    #[tokio::test]
    async fn leaf_count_gap_triggers_unwind_and_replay() {
        let storage = Arc::new(InMemoryStorage::new());
        let (chain, notifications) = chain_of_two();
        // store block 0 and a corrupted block 1 claiming the wrong leaf count
        storage.save_block(&chain[0].0, 10).await.unwrap();
        let corrupted = Block::new(Address::repeat_byte(9), word(0xee), 5, 1, &chain[1].1);
        storage.save_block(&corrupted, 11).await.unwrap();
        let state_after_first = TreeState::empty().append(&[word(0x01).to_fixed_bytes()]).unwrap();
        storage.save_tree_state(&state_after_first).await.unwrap();

        let ledger = Arc::new(ScriptedLedger {
            events: Mutex::new(notifications),
            block_count_l2: 2,
            latest_l1_block: 20,
            ..ScriptedLedger::default()
        });
        let (mut orchestrator, _state) = orchestrator(storage.clone(), ledger);

        synchronize(&mut orchestrator, 0).await.unwrap();

        let stored = storage.blocks_in_order().await.unwrap();
        assert_eq!(2, stored.len());
        assert_eq!(chain[1].0.block_hash(), stored[1].block.block_hash());
        assert!(storage
            .block_by_hash(corrupted.block_hash())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn proposer_state_is_rederived_after_sync() {
        let storage = Arc::new(InMemoryStorage::new());
        let ledger = Arc::new(ScriptedLedger {
            current_proposer: Address::repeat_byte(0x42),
            ..ScriptedLedger::default()
        });
        let (mut orchestrator, state) = orchestrator(storage, ledger);

        synchronize(&mut orchestrator, 0).await.unwrap();
        let info = state.proposer().await;
        assert_eq!(Address::repeat_byte(0x42), info.current_proposer);
        assert!(info.is_me);
    }
}
