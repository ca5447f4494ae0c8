//! L2 blocks and their `propose_block` calldata layout.
//!
//! The block hash is keccak256 over the ABI tuple
//! `(leaf_count, proposer, root, block_number_l2)`, matching what the
//! ledger computes on chain. The full calldata body appends the transaction
//! tuples, so every node can reconstruct proposed blocks from the
//! BlockProposed event's transaction input alone.

use ethers::{
    abi::{
        self,
        ParamType,
        Token,
    },
    types::{
        Address,
        H256,
        U256,
    },
    utils::keccak256,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    transaction::Transaction,
    CodecError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    proposer: Address,
    root: H256,
    leaf_count: u64,
    n_commitments: u64,
    block_number_l2: u64,
    transaction_hashes: Vec<H256>,
    block_hash: H256,
}

impl Block {
    /// Builds a block over an already-validated transaction batch.
    ///
    /// `leaf_count` is the tree's leaf count before this block's
    /// commitments are appended and `root` the root after. The hash is
    /// computed here, once.
    #[must_use]
    pub fn new(
        proposer: Address,
        root: H256,
        leaf_count: u64,
        block_number_l2: u64,
        transactions: &[Transaction],
    ) -> Self {
        let n_commitments = transactions
            .iter()
            .map(|tx| tx.non_zero_commitments().len() as u64)
            .sum();
        let transaction_hashes = transactions.iter().map(Transaction::transaction_hash).collect();
        let mut block = Self {
            proposer,
            root,
            leaf_count,
            n_commitments,
            block_number_l2,
            transaction_hashes,
            block_hash: H256::zero(),
        };
        block.block_hash = block.compute_hash();
        block
    }

    #[must_use]
    pub fn proposer(&self) -> Address {
        self.proposer
    }

    #[must_use]
    pub fn root(&self) -> H256 {
        self.root
    }

    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Number of commitments this block appends to the tree.
    #[must_use]
    pub fn n_commitments(&self) -> u64 {
        self.n_commitments
    }

    #[must_use]
    pub fn block_number_l2(&self) -> u64 {
        self.block_number_l2
    }

    #[must_use]
    pub fn transaction_hashes(&self) -> &[H256] {
        &self.transaction_hashes
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        self.block_hash
    }

    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(self.leaf_count.into()),
            Token::Address(self.proposer),
            Token::FixedBytes(self.root.as_bytes().to_vec()),
            Token::Uint(self.block_number_l2.into()),
        ])
    }

    fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
        ])
    }

    /// The hashed preimage: the block tuple without the transactions.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[self.to_token()])
    }

    #[must_use]
    pub fn compute_hash(&self) -> H256 {
        keccak256(self.encode()).into()
    }

    /// Recomputes the hash and compares it with the carried one; used
    /// defensively on wire objects.
    #[must_use]
    pub fn check_hash(&self) -> bool {
        self.compute_hash() == self.block_hash
    }
}

/// Encodes the `propose_block(block, transactions)` calldata body.
#[must_use]
pub fn encode_calldata(block: &Block, transactions: &[Transaction]) -> Vec<u8> {
    abi::encode(&[
        block.to_token(),
        Token::Array(transactions.iter().map(Transaction::to_token).collect()),
    ])
}

/// Decodes a `propose_block` calldata body back into the block and its
/// transactions. The block hash and all transaction hashes are recomputed
/// from the decoded fields.
///
/// # Errors
/// Returns an error when the bytes do not match the calldata layout, a
/// transaction declares an unknown type, or a compressed proof point fails
/// to decompress.
pub fn decode_calldata(bytes: &[u8]) -> Result<(Block, Vec<Transaction>), CodecError> {
    let mut tokens = abi::decode(
        &[
            Block::param_type(),
            ParamType::Array(Box::new(Transaction::param_type())),
        ],
        bytes,
    )?;
    if tokens.len() != 2 {
        return Err(CodecError::TokenShape);
    }
    let transactions_token = tokens.pop().expect("length checked above");
    let block_token = tokens.pop().expect("length checked above");

    let Token::Tuple(fields) = block_token else {
        return Err(CodecError::TokenShape);
    };
    let [Token::Uint(leaf_count), Token::Address(proposer), Token::FixedBytes(root), Token::Uint(block_number_l2)] =
        fields.as_slice()
    else {
        return Err(CodecError::TokenShape);
    };
    if root.len() != 32 {
        return Err(CodecError::TokenShape);
    }

    let Token::Array(items) = transactions_token else {
        return Err(CodecError::TokenShape);
    };
    let transactions = items
        .into_iter()
        .map(Transaction::from_token)
        .collect::<Result<Vec<_>, _>>()?;

    let block = Block::new(
        *proposer,
        H256::from_slice(root),
        uint_to_u64(*leaf_count)?,
        uint_to_u64(*block_number_l2)?,
        &transactions,
    );
    Ok((block, transactions))
}

fn uint_to_u64(value: U256) -> Result<u64, CodecError> {
    if value > U256::from(u64::MAX) {
        return Err(CodecError::TokenShape);
    }
    Ok(value.low_u64())
}
