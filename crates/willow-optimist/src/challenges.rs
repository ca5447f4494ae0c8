//! Fraud-proof challenge construction and the commit-reveal flow.
//!
//! Every [`willow_core::BlockError`] maps onto one ledger challenge
//! function. A [`Challenge`] carries exactly the evidence its function
//! needs; [`Challenge::calldata`] ABI-encodes the call with a random salt
//! so the commitment hash leaks nothing.
//!
//! Front-running protection: the node first submits
//! `commitToChallenge(keccak(calldata))` and persists the calldata keyed by
//! that hash. The reveal goes out only once a CommittedToChallenge event
//! shows the commit was mined from an address this node controls.

use std::sync::Arc;

use ethers::{
    abi::{
        self,
        Token,
    },
    types::H256,
    utils::keccak256,
};
use eyre::{
    eyre,
    Result,
    WrapErr as _,
};
use tokio::sync::Mutex;
use tracing::{
    info,
    instrument,
    warn,
};
use willow_core::{
    Block,
    BlockError,
    Transaction,
};

use crate::{
    signer,
    signer::SignerMessage,
    state::SharedState,
    storage::Storage,
};

/// One variant per ledger challenge function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// The declared root is wrong. The ledger recomputes the prior root
    /// from the frontier before the prior block, then replays the
    /// challenged block on top.
    NewRootCorrect {
        prior_block: Option<Block>,
        prior_transactions: Vec<Transaction>,
        frontier_before_prior: Vec<[u8; 32]>,
        block: Block,
        transactions: Vec<Transaction>,
    },
    /// The same transaction appears in two accepted blocks.
    NoDuplicateTransaction {
        block: Block,
        index: usize,
        other_block: Block,
        other_index: usize,
    },
    /// A transaction's fields are inconsistent with its declared type.
    TransactionType {
        block: Block,
        transactions: Vec<Transaction>,
        index: usize,
    },
    /// A transaction references a historic root that never existed.
    HistoricRoot {
        block: Block,
        transactions: Vec<Transaction>,
        index: usize,
    },
    /// A transaction's proof does not verify. Carries the uncompressed
    /// proof and, for transfers, the referenced historic blocks.
    ProofVerification {
        block: Block,
        transactions: Vec<Transaction>,
        index: usize,
        historic_blocks: Vec<Block>,
    },
    /// The same nullifier is spent twice, across blocks or within one.
    Nullifier {
        block: Block,
        transactions: Vec<Transaction>,
        index: usize,
        nullifier_index: usize,
        other_block: Block,
        other_transactions: Vec<Transaction>,
        other_index: usize,
        other_nullifier_index: usize,
    },
    /// The declared leaf count does not continue from the prior block.
    LeafCountCorrect {
        prior_block: Block,
        prior_transactions: Vec<Transaction>,
        block: Block,
        transactions: Vec<Transaction>,
    },
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn block_token(block: &Block) -> Token {
    Token::Bytes(block.encode())
}

fn optional_block_token(block: Option<&Block>) -> Token {
    Token::Bytes(block.map(Block::encode).unwrap_or_default())
}

fn transactions_token(transactions: &[Transaction]) -> Token {
    Token::Array(
        transactions
            .iter()
            .map(|tx| Token::Bytes(tx.encode()))
            .collect(),
    )
}

fn frontier_token(frontier: &[[u8; 32]]) -> Token {
    Token::FixedArray(
        frontier
            .iter()
            .map(|slot| Token::FixedBytes(slot.to_vec()))
            .collect(),
    )
}

impl Challenge {
    /// The ledger call for this challenge, salted so the commitment hash
    /// is unlinkable to the evidence.
    #[must_use]
    pub fn calldata(&self, salt: [u8; 32]) -> Vec<u8> {
        let salt_token = Token::FixedBytes(salt.to_vec());
        let (signature, tokens) = match self {
            Self::NewRootCorrect {
                prior_block,
                prior_transactions,
                frontier_before_prior,
                block,
                transactions,
            } => (
                "challengeNewRootCorrect(bytes,bytes[],bytes32[33],bytes,bytes[],bytes32)",
                vec![
                    optional_block_token(prior_block.as_ref()),
                    transactions_token(prior_transactions),
                    frontier_token(frontier_before_prior),
                    block_token(block),
                    transactions_token(transactions),
                    salt_token,
                ],
            ),
            Self::NoDuplicateTransaction {
                block,
                index,
                other_block,
                other_index,
            } => (
                "challengeNoDuplicateTransaction(bytes,uint256,bytes,uint256,bytes32)",
                vec![
                    block_token(block),
                    Token::Uint((*index).into()),
                    block_token(other_block),
                    Token::Uint((*other_index).into()),
                    salt_token,
                ],
            ),
            Self::TransactionType {
                block,
                transactions,
                index,
            } => (
                "challengeTransactionType(bytes,bytes[],uint256,bytes32)",
                vec![
                    block_token(block),
                    transactions_token(transactions),
                    Token::Uint((*index).into()),
                    salt_token,
                ],
            ),
            Self::HistoricRoot {
                block,
                transactions,
                index,
            } => (
                "challengeHistoricRoot(bytes,bytes[],uint256,bytes32)",
                vec![
                    block_token(block),
                    transactions_token(transactions),
                    Token::Uint((*index).into()),
                    salt_token,
                ],
            ),
            Self::ProofVerification {
                block,
                transactions,
                index,
                historic_blocks,
            } => {
                let proof = transactions
                    .get(*index)
                    .map(|tx| tx.proof().elements().to_vec())
                    .unwrap_or_default();
                (
                    "challengeProofVerification(bytes,bytes[],uint256,uint256[8],bytes[],bytes32)",
                    vec![
                        block_token(block),
                        transactions_token(transactions),
                        Token::Uint((*index).into()),
                        Token::FixedArray(proof.into_iter().map(Token::Uint).collect()),
                        Token::Array(
                            historic_blocks
                                .iter()
                                .map(|b| Token::Bytes(b.encode()))
                                .collect(),
                        ),
                        salt_token,
                    ],
                )
            }
            Self::Nullifier {
                block,
                transactions,
                index,
                nullifier_index,
                other_block,
                other_transactions,
                other_index,
                other_nullifier_index,
            } => (
                "challengeNullifier(bytes,bytes[],uint256,uint256,bytes,bytes[],uint256,uint256,\
                 bytes32)",
                vec![
                    block_token(block),
                    transactions_token(transactions),
                    Token::Uint((*index).into()),
                    Token::Uint((*nullifier_index).into()),
                    block_token(other_block),
                    transactions_token(other_transactions),
                    Token::Uint((*other_index).into()),
                    Token::Uint((*other_nullifier_index).into()),
                    salt_token,
                ],
            ),
            Self::LeafCountCorrect {
                prior_block,
                prior_transactions,
                block,
                transactions,
            } => (
                "challengeLeafCountCorrect(bytes,bytes[],bytes,bytes[],bytes32)",
                vec![
                    block_token(prior_block),
                    transactions_token(prior_transactions),
                    block_token(block),
                    transactions_token(transactions),
                    salt_token,
                ],
            ),
        };
        let mut calldata = selector(signature).to_vec();
        calldata.extend(abi::encode(&tokens));
        calldata
    }
}

pub struct ChallengeGenerator {
    storage: Arc<dyn Storage>,
    signer: signer::Handle,
    state: Arc<SharedState>,
    // challenges prepared while challenge production was disabled
    pending: Mutex<Vec<Challenge>>,
}

impl ChallengeGenerator {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, signer: signer::Handle, state: Arc<SharedState>) -> Self {
        Self {
            storage,
            signer,
            state,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Builds the challenge for `err` and either commits it or, while
    /// challenge production is disabled, holds it for later.
    #[instrument(skip_all, fields(block_hash = %block.block_hash(), code = err.code()))]
    pub async fn handle_bad_block(
        &self,
        block: &Block,
        transactions: &[Transaction],
        err: &BlockError,
    ) -> Result<()> {
        let challenge = self
            .prepare(block, transactions, err)
            .await
            .wrap_err("failed to assemble challenge evidence")?;
        if !self.state.challenges_enabled() {
            warn!("challenges disabled; holding the prepared challenge");
            self.pending.lock().await.push(challenge);
            return Ok(());
        }
        self.commit(challenge).await
    }

    /// Re-enables challenge production and flushes anything held.
    pub async fn enable(&self) -> Result<()> {
        self.state.set_challenges_enabled(true);
        let held: Vec<Challenge> = self.pending.lock().await.drain(..).collect();
        for challenge in held {
            self.commit(challenge).await?;
        }
        Ok(())
    }

    async fn commit(&self, challenge: Challenge) -> Result<()> {
        let salt: [u8; 32] = rand::random();
        let calldata = challenge.calldata(salt);
        let commit_hash = H256::from(keccak256(&calldata));
        self.storage
            .save_challenge_commit(commit_hash, calldata)
            .await
            .wrap_err("failed to persist the challenge commit")?;

        let mut commit_calldata = selector("commitToChallenge(bytes32)").to_vec();
        commit_calldata.extend(abi::encode(&[Token::FixedBytes(
            commit_hash.as_bytes().to_vec(),
        )]));
        self.signer
            .send(SignerMessage::Commit {
                calldata: commit_calldata,
            })
            .await
            .wrap_err("signer is gone")?;
        info!(%commit_hash, "committed to a challenge");
        Ok(())
    }

    /// Reveals a challenge whose commit was just confirmed on chain.
    /// Ignores commit hashes this node never stored, since every
    /// challenger sees every CommittedToChallenge event.
    pub async fn reveal(&self, commit_hash: H256) -> Result<()> {
        let Some(calldata) = self
            .storage
            .take_challenge_commit(commit_hash)
            .await
            .wrap_err("failed to look up the challenge commit")?
        else {
            return Ok(());
        };
        self.signer
            .send(SignerMessage::Challenge {
                calldata,
            })
            .await
            .wrap_err("signer is gone")?;
        info!(%commit_hash, "revealed a committed challenge");
        Ok(())
    }

    /// Assembles the evidence `err`'s ledger challenge function needs.
    pub async fn prepare(
        &self,
        block: &Block,
        transactions: &[Transaction],
        err: &BlockError,
    ) -> Result<Challenge> {
        match err {
            BlockError::RootMismatch { .. } => {
                let (prior_block, prior_transactions, frontier_before_prior) =
                    self.prior_block_evidence(block).await?;
                Ok(Challenge::NewRootCorrect {
                    prior_block,
                    prior_transactions,
                    frontier_before_prior,
                    block: block.clone(),
                    transactions: transactions.to_vec(),
                })
            }
            BlockError::DuplicateTransaction {
                transaction_hash,
                index,
                other_block_hash,
            } => {
                let other_block = self.stored_block(*other_block_hash).await?;
                let other_index = other_block
                    .transaction_hashes()
                    .iter()
                    .position(|hash| hash == transaction_hash)
                    .ok_or_else(|| {
                        eyre!(
                            "block {other_block_hash:#x} does not contain transaction \
                             {transaction_hash:#x}"
                        )
                    })?;
                Ok(Challenge::NoDuplicateTransaction {
                    block: block.clone(),
                    index: *index,
                    other_block,
                    other_index,
                })
            }
            BlockError::InvalidTransactionType { index } => Ok(Challenge::TransactionType {
                block: block.clone(),
                transactions: transactions.to_vec(),
                index: *index,
            }),
            BlockError::HistoricRootMissing { index, .. } => Ok(Challenge::HistoricRoot {
                block: block.clone(),
                transactions: transactions.to_vec(),
                index: *index,
            }),
            BlockError::InvalidProof { index } => {
                let transaction = transactions
                    .get(*index)
                    .ok_or_else(|| eyre!("no transaction at index {index}"))?;
                let mut historic_blocks = Vec::new();
                for block_number in transaction.historic_root_block_numbers() {
                    if let Some(stored) = self.storage.block_by_number(*block_number).await? {
                        historic_blocks.push(stored.block);
                    }
                }
                Ok(Challenge::ProofVerification {
                    block: block.clone(),
                    transactions: transactions.to_vec(),
                    index: *index,
                    historic_blocks,
                })
            }
            BlockError::DuplicateNullifier {
                nullifier,
                index,
                other_block_hash,
            } => {
                let other_block = self.stored_block(*other_block_hash).await?;
                let other_transactions = self.stored_transactions(&other_block).await?;
                let (other_index, other_nullifier_index) =
                    locate_nullifier(&other_transactions, *nullifier).ok_or_else(|| {
                        eyre!(
                            "nullifier {nullifier:#x} not found in block {other_block_hash:#x}"
                        )
                    })?;
                let nullifier_index = transactions
                    .get(*index)
                    .and_then(|tx| {
                        tx.nullifiers().iter().position(|n| n == nullifier)
                    })
                    .ok_or_else(|| {
                        eyre!("nullifier {nullifier:#x} not found at index {index}")
                    })?;
                Ok(Challenge::Nullifier {
                    block: block.clone(),
                    transactions: transactions.to_vec(),
                    index: *index,
                    nullifier_index,
                    other_block,
                    other_transactions,
                    other_index,
                    other_nullifier_index,
                })
            }
            BlockError::DuplicateNullifierInBlock {
                nullifier,
                first_index,
                second_index,
            } => {
                let position = |index: usize| {
                    transactions
                        .get(index)
                        .and_then(|tx| tx.nullifiers().iter().position(|n| n == nullifier))
                        .ok_or_else(|| {
                            eyre!("nullifier {nullifier:#x} not found at index {index}")
                        })
                };
                let first_nullifier_index = position(*first_index)?;
                let second_nullifier_index = position(*second_index)?;
                Ok(Challenge::Nullifier {
                    block: block.clone(),
                    transactions: transactions.to_vec(),
                    index: *second_index,
                    nullifier_index: second_nullifier_index,
                    other_block: block.clone(),
                    other_transactions: transactions.to_vec(),
                    other_index: *first_index,
                    other_nullifier_index: first_nullifier_index,
                })
            }
            BlockError::LeafCountMismatch { .. } => {
                let prior = self
                    .storage
                    .block_by_number(block.block_number_l2().saturating_sub(1))
                    .await?
                    .ok_or_else(|| {
                        eyre!(
                            "prior block {} is not stored",
                            block.block_number_l2().saturating_sub(1)
                        )
                    })?;
                let prior_transactions = self.stored_transactions(&prior.block).await?;
                Ok(Challenge::LeafCountCorrect {
                    prior_block: prior.block,
                    prior_transactions,
                    block: block.clone(),
                    transactions: transactions.to_vec(),
                })
            }
        }
    }

    /// The prior block, its transactions, and the padded frontier before
    /// the prior block was applied. All empty when challenging block 0.
    async fn prior_block_evidence(
        &self,
        block: &Block,
    ) -> Result<(Option<Block>, Vec<Transaction>, Vec<[u8; 32]>)> {
        if block.block_number_l2() == 0 {
            return Ok((
                None,
                Vec::new(),
                willow_merkle::Frontier::new().to_padded(),
            ));
        }
        let prior = self
            .storage
            .block_by_number(block.block_number_l2() - 1)
            .await?
            .ok_or_else(|| eyre!("prior block {} is not stored", block.block_number_l2() - 1))?;
        let prior_transactions = self.stored_transactions(&prior.block).await?;
        let state = self
            .storage
            .tree_state_by_leaf_count(prior.block.leaf_count())
            .await?
            .ok_or_else(|| {
                eyre!(
                    "no tree snapshot at leaf count {}",
                    prior.block.leaf_count()
                )
            })?;
        Ok((
            Some(prior.block),
            prior_transactions,
            state.frontier().to_padded(),
        ))
    }

    async fn stored_block(&self, hash: H256) -> Result<Block> {
        Ok(self
            .storage
            .block_by_hash(hash)
            .await?
            .ok_or_else(|| eyre!("block {hash:#x} is not stored"))?
            .block)
    }

    async fn stored_transactions(&self, block: &Block) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::with_capacity(block.transaction_hashes().len());
        for hash in block.transaction_hashes() {
            let transaction = self
                .storage
                .transaction_by_hash(*hash)
                .await?
                .ok_or_else(|| eyre!("transaction {hash:#x} is not stored"))?;
            transactions.push(transaction);
        }
        Ok(transactions)
    }
}

fn locate_nullifier(transactions: &[Transaction], nullifier: H256) -> Option<(usize, usize)> {
    for (index, transaction) in transactions.iter().enumerate() {
        if let Some(nullifier_index) =
            transaction.nullifiers().iter().position(|n| *n == nullifier)
        {
            return Some((index, nullifier_index));
        }
    }
    None
}
