//! Transport to the external transaction signer.
//!
//! The node never holds a key: it hands unsigned ledger calldata to a
//! separate signing service over an mpsc channel and moves on. Ordering
//! within the channel is preserved, which the commit-then-reveal challenge
//! flow relies on.

use ethers::types::H256;
use tokio::{
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerMessage {
    /// `commit_to_challenge(bytes32)` calldata.
    Commit { calldata: Vec<u8> },
    /// A revealed challenge call.
    Challenge { calldata: Vec<u8> },
    /// `propose_block(block, transactions)` calldata for the block just
    /// assembled, identified by its hash for logging.
    ProposeBlock {
        block_hash: H256,
        calldata: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("signer channel closed")]
pub struct SignerGone;

/// Cloneable sending side handed to the assembler, the challenge generator
/// and the orchestrator.
#[derive(Debug, Clone)]
pub struct Handle {
    sender: mpsc::Sender<SignerMessage>,
}

impl Handle {
    /// # Errors
    /// Returns an error if the signer task has shut down.
    pub async fn send(&self, message: SignerMessage) -> Result<(), SignerGone> {
        self.sender.send(message).await.map_err(|_| SignerGone)
    }
}

/// Drains signing requests, emitting each one as a structured log line for
/// the external signing service to pick up.
///
/// # Errors
/// Returns an error if every [`Handle`] has been dropped.
pub async fn relay(
    mut receiver: mpsc::Receiver<SignerMessage>,
    shutdown_token: CancellationToken,
) -> eyre::Result<()> {
    loop {
        select! {
            message = receiver.recv() => {
                let Some(message) = message else {
                    eyre::bail!("all signer handles dropped");
                };
                match message {
                    SignerMessage::Commit { calldata } => info!(
                        calldata = hex::encode(&calldata),
                        "requesting signature over a challenge commitment",
                    ),
                    SignerMessage::Challenge { calldata } => info!(
                        calldata = hex::encode(&calldata),
                        "requesting signature over a challenge reveal",
                    ),
                    SignerMessage::ProposeBlock { block_hash, calldata } => info!(
                        block_hash = %block_hash,
                        calldata = hex::encode(&calldata),
                        "requesting signature over a block proposal",
                    ),
                }
            }
            () = shutdown_token.cancelled() => {
                info!("signer relay shutting down");
                return Ok(());
            }
        }
    }
}

#[must_use]
pub fn channel(capacity: usize) -> (Handle, mpsc::Receiver<SignerMessage>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        Handle {
            sender,
        },
        receiver,
    )
}
