//! The off-chain optimist node of the willow rollup.
//!
//! The node watches the L1 ledger contract, mirrors its event stream into
//! local storage, assembles L2 blocks out of mempooled transactions when it
//! holds the proposer slot, and challenges blocks whose claimed state does
//! not recompute.

pub(crate) mod assembler;
pub(crate) mod block_checker;
pub(crate) mod challenges;
pub(crate) mod config;
pub(crate) mod ethereum;
pub(crate) mod ledger;
pub mod optimist;
pub(crate) mod orchestrator;
pub(crate) mod signer;
pub(crate) mod state;
pub(crate) mod state_sync;
pub(crate) mod storage;
pub(crate) mod transaction_checker;
pub(crate) mod verifier;

pub use config::Config;
pub use optimist::{
    Optimist,
    ShutdownHandle,
};
