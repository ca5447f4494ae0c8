//! State shared between the orchestrator and the assembler.

use std::{
    collections::HashSet,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use ethers::types::Address;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProposerInfo {
    pub current_proposer: Address,
    pub is_me: bool,
}

/// Who is proposing, whether this node may assemble blocks right now, and
/// whether challenges are administratively enabled.
#[derive(Debug)]
pub struct SharedState {
    node_address: Address,
    proposer: RwLock<ProposerInfo>,
    // every address ever observed holding the proposer slot; registration
    // itself happens on L1, so the set only grows as rotations are seen
    registrants: RwLock<HashSet<Address>>,
    // set while a bad block awaits its rollback; halts assembly and skips
    // further block checks, since the rollback will sweep them anyway
    stop_marker: AtomicBool,
    challenges_enabled: AtomicBool,
    // one-shot request to assemble a block even without a full batch
    force_assembly: AtomicBool,
}

impl SharedState {
    #[must_use]
    pub fn new(node_address: Address) -> Arc<Self> {
        Arc::new(Self {
            node_address,
            proposer: RwLock::new(ProposerInfo::default()),
            registrants: RwLock::new(HashSet::new()),
            stop_marker: AtomicBool::new(false),
            challenges_enabled: AtomicBool::new(true),
            force_assembly: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn node_address(&self) -> Address {
        self.node_address
    }

    pub async fn proposer(&self) -> ProposerInfo {
        *self.proposer.read().await
    }

    /// Records the new proposer, returning the outgoing info.
    pub async fn set_current_proposer(&self, proposer: Address) -> ProposerInfo {
        if proposer != Address::zero() {
            self.registrants.write().await.insert(proposer);
        }
        let mut info = self.proposer.write().await;
        let outgoing = *info;
        *info = ProposerInfo {
            current_proposer: proposer,
            is_me: proposer == self.node_address,
        };
        outgoing
    }

    /// Proposers this node has seen hold the slot so far.
    pub async fn known_registrants(&self) -> usize {
        self.registrants.read().await.len()
    }

    #[must_use]
    pub fn stop_marker_pending(&self) -> bool {
        self.stop_marker.load(Ordering::Acquire)
    }

    pub fn set_stop_marker(&self, pending: bool) {
        self.stop_marker.store(pending, Ordering::Release);
    }

    #[must_use]
    pub fn challenges_enabled(&self) -> bool {
        self.challenges_enabled.load(Ordering::Acquire)
    }

    pub fn set_challenges_enabled(&self, enabled: bool) {
        self.challenges_enabled.store(enabled, Ordering::Release);
    }

    pub fn request_block_assembly(&self) {
        self.force_assembly.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn force_assembly_requested(&self) -> bool {
        self.force_assembly.load(Ordering::Acquire)
    }

    /// Consumes a pending force-assembly request. Only call once the
    /// request is actually being served; an unserved request must stay
    /// set for the next assembly poll.
    pub fn take_force_assembly(&self) {
        self.force_assembly.store(false, Ordering::Release);
    }
}
