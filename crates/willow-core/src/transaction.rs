//! The private-state transaction type and its canonical encoding.
//!
//! A transaction is immutable once hashed: the hash is keccak256 over the
//! ABI tuple encoding of every other field, with the proof compressed first.
//! Fixed-arity arrays (commitments, nullifiers, secrets, historic root
//! references) are zero-padded so the tuple layout is identical for all
//! transaction types.

use ethers::{
    abi::{
        self,
        ParamType,
        Token,
    },
    types::{
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
    proof::{
        CompressedProof,
        Proof,
    },
    CodecError,
};

/// Fixed arity of the commitment, nullifier, secret and historic-root arrays.
pub const ARITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Deposit,
    SingleTransfer,
    DoubleTransfer,
    Withdraw,
}

impl TransactionType {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Deposit => 0,
            Self::SingleTransfer => 1,
            Self::DoubleTransfer => 2,
            Self::Withdraw => 3,
        }
    }

    /// # Errors
    /// Returns an error if `value` is not one of the four known types.
    pub fn from_u64(value: u64) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Deposit),
            1 => Ok(Self::SingleTransfer),
            2 => Ok(Self::DoubleTransfer),
            3 => Ok(Self::Withdraw),
            other => Err(CodecError::UnknownTransactionType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    transaction_type: TransactionType,
    value: U256,
    fee: U256,
    token_id: U256,
    erc_address: H256,
    recipient_address: H256,
    commitments: [H256; ARITY],
    nullifiers: [H256; ARITY],
    compressed_secrets: [H256; ARITY],
    historic_root_block_number_l2: [u64; ARITY],
    proof: Proof,
    transaction_hash: H256,
}

impl Transaction {
    pub(crate) fn from_parts(builder: TransactionBuilder) -> Self {
        let TransactionBuilder {
            transaction_type,
            value,
            fee,
            token_id,
            erc_address,
            recipient_address,
            commitments,
            nullifiers,
            compressed_secrets,
            historic_root_block_number_l2,
            proof,
            claimed_hash,
        } = builder;
        let mut transaction = Self {
            transaction_type,
            value,
            fee,
            token_id,
            erc_address,
            recipient_address,
            commitments: pad(commitments),
            nullifiers: pad(nullifiers),
            compressed_secrets: pad(compressed_secrets),
            historic_root_block_number_l2: pad_numbers(historic_root_block_number_l2),
            proof,
            transaction_hash: H256::zero(),
        };
        transaction.transaction_hash = claimed_hash.unwrap_or_else(|| transaction.compute_hash());
        transaction
    }

    #[must_use]
    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    #[must_use]
    pub fn value(&self) -> U256 {
        self.value
    }

    #[must_use]
    pub fn fee(&self) -> U256 {
        self.fee
    }

    #[must_use]
    pub fn token_id(&self) -> U256 {
        self.token_id
    }

    #[must_use]
    pub fn erc_address(&self) -> H256 {
        self.erc_address
    }

    #[must_use]
    pub fn recipient_address(&self) -> H256 {
        self.recipient_address
    }

    #[must_use]
    pub fn commitments(&self) -> &[H256; ARITY] {
        &self.commitments
    }

    #[must_use]
    pub fn nullifiers(&self) -> &[H256; ARITY] {
        &self.nullifiers
    }

    #[must_use]
    pub fn compressed_secrets(&self) -> &[H256; ARITY] {
        &self.compressed_secrets
    }

    #[must_use]
    pub fn historic_root_block_numbers(&self) -> &[u64; ARITY] {
        &self.historic_root_block_number_l2
    }

    #[must_use]
    pub fn proof(&self) -> &Proof {
        &self.proof
    }

    #[must_use]
    pub fn transaction_hash(&self) -> H256 {
        self.transaction_hash
    }

    /// Commitments that actually enter the tree; withdrawals contribute none.
    #[must_use]
    pub fn non_zero_commitments(&self) -> Vec<H256> {
        self.commitments
            .iter()
            .copied()
            .filter(|c| !c.is_zero())
            .collect()
    }

    #[must_use]
    pub fn non_zero_nullifiers(&self) -> Vec<H256> {
        self.nullifiers
            .iter()
            .copied()
            .filter(|n| !n.is_zero())
            .collect()
    }

    /// The canonical single-transaction encoding: the same tuple the
    /// ledger's `propose_block` calldata carries, with the proof compressed.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[self.to_token()])
    }

    /// keccak256 over [`Transaction::encode`].
    #[must_use]
    pub fn compute_hash(&self) -> H256 {
        keccak256(self.encode()).into()
    }

    /// Recomputes the hash and compares it with the carried one.
    ///
    /// Objects arriving over the wire may carry a tampered hash; this is
    /// checked defensively even though locally built transactions compute
    /// the hash exactly once.
    #[must_use]
    pub fn check_hash(&self) -> bool {
        self.compute_hash() == self.transaction_hash
    }

    /// The type-specific public-input vector handed to the external
    /// verifier. `historic_roots` are the roots resolved from this
    /// transaction's historic block references, in order.
    #[must_use]
    pub fn public_inputs(&self, historic_roots: &[H256; ARITY]) -> Vec<U256> {
        let word = |h: H256| U256::from_big_endian(h.as_bytes());
        let mut inputs = vec![word(self.erc_address), self.token_id, self.value];
        match self.transaction_type {
            TransactionType::Deposit => {
                inputs.push(word(self.commitments[0]));
            }
            TransactionType::SingleTransfer => {
                inputs.push(word(self.commitments[0]));
                inputs.push(word(self.nullifiers[0]));
                inputs.push(word(historic_roots[0]));
                inputs.push(word(self.recipient_address));
                inputs.extend(self.compressed_secrets.iter().map(|s| word(*s)));
            }
            TransactionType::DoubleTransfer => {
                inputs.extend(self.commitments.iter().map(|c| word(*c)));
                inputs.extend(self.nullifiers.iter().map(|n| word(*n)));
                inputs.extend(historic_roots.iter().map(|r| word(*r)));
                inputs.push(word(self.recipient_address));
                inputs.extend(self.compressed_secrets.iter().map(|s| word(*s)));
            }
            TransactionType::Withdraw => {
                inputs.push(word(self.nullifiers[0]));
                inputs.push(word(self.recipient_address));
                inputs.push(word(historic_roots[0]));
            }
        }
        inputs
    }

    /// Decodes a `submit_transaction` calldata body. The hash is recomputed
    /// from the decoded fields.
    ///
    /// # Errors
    /// Returns an error when the bytes do not match the tuple layout, the
    /// declared type is unknown, or a proof point fails to decompress.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut tokens = abi::decode(&[Self::param_type()], bytes)?;
        if tokens.len() != 1 {
            return Err(CodecError::TokenShape);
        }
        Self::from_token(tokens.remove(0))
    }

    pub(crate) fn to_token(&self) -> Token {
        let fixed_bytes =
            |words: &[H256]| Token::FixedArray(words.iter().map(|w| Token::FixedBytes(w.as_bytes().to_vec())).collect());
        Token::Tuple(vec![
            Token::Uint(self.value),
            Token::Uint(self.fee),
            Token::Uint(self.transaction_type.as_u64().into()),
            Token::Uint(self.token_id),
            Token::FixedArray(
                self.historic_root_block_number_l2
                    .iter()
                    .map(|n| Token::Uint((*n).into()))
                    .collect(),
            ),
            Token::FixedBytes(self.erc_address.as_bytes().to_vec()),
            Token::FixedBytes(self.recipient_address.as_bytes().to_vec()),
            fixed_bytes(&self.commitments),
            fixed_bytes(&self.nullifiers),
            fixed_bytes(&self.compressed_secrets),
            Token::FixedArray(
                self.proof
                    .compress()
                    .words()
                    .iter()
                    .map(|w| Token::Uint(*w))
                    .collect(),
            ),
        ])
    }

    pub(crate) fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::FixedArray(Box::new(ParamType::Uint(256)), ARITY),
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::FixedArray(Box::new(ParamType::FixedBytes(32)), ARITY),
            ParamType::FixedArray(Box::new(ParamType::FixedBytes(32)), ARITY),
            ParamType::FixedArray(Box::new(ParamType::FixedBytes(32)), ARITY),
            ParamType::FixedArray(Box::new(ParamType::Uint(256)), crate::proof::COMPRESSED_PROOF_LEN),
        ])
    }

    pub(crate) fn from_token(token: Token) -> Result<Self, CodecError> {
        let Token::Tuple(fields) = token else {
            return Err(CodecError::TokenShape);
        };
        let mut fields = fields.into_iter();
        let mut next_uint = |fields: &mut dyn Iterator<Item = Token>| -> Result<U256, CodecError> {
            match fields.next() {
                Some(Token::Uint(u)) => Ok(u),
                _ => Err(CodecError::TokenShape),
            }
        };
        let value = next_uint(&mut fields)?;
        let fee = next_uint(&mut fields)?;
        let transaction_type = TransactionType::from_u64(next_uint(&mut fields)?.low_u64())?;
        let token_id = next_uint(&mut fields)?;
        let historic = uint_array::<ARITY>(fields.next())?;
        let erc_address = fixed_bytes_word(fields.next())?;
        let recipient_address = fixed_bytes_word(fields.next())?;
        let commitments = word_array::<ARITY>(fields.next())?;
        let nullifiers = word_array::<ARITY>(fields.next())?;
        let compressed_secrets = word_array::<ARITY>(fields.next())?;
        let compressed_proof = uint_array::<{ crate::proof::COMPRESSED_PROOF_LEN }>(fields.next())?;
        let proof = Proof::decompress(&CompressedProof::new(compressed_proof))?;
        Ok(Self::from_parts(TransactionBuilder {
            transaction_type,
            value,
            fee,
            token_id,
            erc_address,
            recipient_address,
            commitments: commitments.to_vec(),
            nullifiers: nullifiers.to_vec(),
            compressed_secrets: compressed_secrets.to_vec(),
            historic_root_block_number_l2: historic.iter().map(|u| u.low_u64()).collect(),
            proof,
            claimed_hash: None,
        }))
    }
}

fn fixed_bytes_word(token: Option<Token>) -> Result<H256, CodecError> {
    match token {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
            Ok(H256::from_slice(&bytes))
        }
        _ => Err(CodecError::TokenShape),
    }
}

fn word_array<const N: usize>(token: Option<Token>) -> Result<[H256; N], CodecError> {
    let Some(Token::FixedArray(items)) = token else {
        return Err(CodecError::TokenShape);
    };
    let words = items
        .into_iter()
        .map(|t| fixed_bytes_word(Some(t)))
        .collect::<Result<Vec<_>, _>>()?;
    words.try_into().map_err(|_| CodecError::TokenShape)
}

fn uint_array<const N: usize>(token: Option<Token>) -> Result<[U256; N], CodecError> {
    let Some(Token::FixedArray(items)) = token else {
        return Err(CodecError::TokenShape);
    };
    let uints = items
        .into_iter()
        .map(|t| match t {
            Token::Uint(u) => Ok(u),
            _ => Err(CodecError::TokenShape),
        })
        .collect::<Result<Vec<_>, _>>()?;
    uints.try_into().map_err(|_| CodecError::TokenShape)
}

fn pad(mut words: Vec<H256>) -> [H256; ARITY] {
    words.resize(ARITY, H256::zero());
    words
        .try_into()
        .expect("vector was resized to the target arity just above")
}

fn pad_numbers(mut numbers: Vec<u64>) -> [u64; ARITY] {
    numbers.resize(ARITY, 0);
    numbers
        .try_into()
        .expect("vector was resized to the target arity just above")
}

/// Builds a [`Transaction`], zero-padding the variable-length inputs and
/// computing the hash exactly once.
///
/// `claimed_hash` exists for rehydrating wire objects that already carry a
/// (possibly tampered) hash; leave it unset to compute the canonical one.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    pub transaction_type: TransactionType,
    pub value: U256,
    pub fee: U256,
    pub token_id: U256,
    pub erc_address: H256,
    pub recipient_address: H256,
    pub commitments: Vec<H256>,
    pub nullifiers: Vec<H256>,
    pub compressed_secrets: Vec<H256>,
    pub historic_root_block_number_l2: Vec<u64>,
    pub proof: Proof,
    pub claimed_hash: Option<H256>,
}

impl TransactionBuilder {
    #[must_use]
    pub fn new(transaction_type: TransactionType, proof: Proof) -> Self {
        Self {
            transaction_type,
            value: U256::zero(),
            fee: U256::zero(),
            token_id: U256::zero(),
            erc_address: H256::zero(),
            recipient_address: H256::zero(),
            commitments: Vec::new(),
            nullifiers: Vec::new(),
            compressed_secrets: Vec::new(),
            historic_root_block_number_l2: Vec::new(),
            proof,
            claimed_hash: None,
        }
    }

    #[must_use]
    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn fee(mut self, fee: U256) -> Self {
        self.fee = fee;
        self
    }

    #[must_use]
    pub fn token_id(mut self, token_id: U256) -> Self {
        self.token_id = token_id;
        self
    }

    #[must_use]
    pub fn erc_address(mut self, erc_address: H256) -> Self {
        self.erc_address = erc_address;
        self
    }

    #[must_use]
    pub fn recipient_address(mut self, recipient_address: H256) -> Self {
        self.recipient_address = recipient_address;
        self
    }

    #[must_use]
    pub fn commitments(mut self, commitments: Vec<H256>) -> Self {
        self.commitments = commitments;
        self
    }

    #[must_use]
    pub fn nullifiers(mut self, nullifiers: Vec<H256>) -> Self {
        self.nullifiers = nullifiers;
        self
    }

    #[must_use]
    pub fn compressed_secrets(mut self, compressed_secrets: Vec<H256>) -> Self {
        self.compressed_secrets = compressed_secrets;
        self
    }

    #[must_use]
    pub fn historic_root_block_numbers(mut self, numbers: Vec<u64>) -> Self {
        self.historic_root_block_number_l2 = numbers;
        self
    }

    #[must_use]
    pub fn claimed_hash(mut self, hash: H256) -> Self {
        self.claimed_hash = Some(hash);
        self
    }

    #[must_use]
    pub fn build(self) -> Transaction {
        Transaction::from_parts(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_proof() -> Proof {
        // the alt-bn128 generator and its negation, valid points throughout
        let p = U256::from_dec_str(
            "21888242871839275222246405745257275088696311157297823662689037894645226208583",
        )
        .unwrap();
        let one = U256::from(1);
        let two = U256::from(2);
        Proof::new([one, two, one, one, two, p - 2, one, two])
    }

    fn word(i: u8) -> H256 {
        let mut out = [0; 32];
        out[31] = i;
        H256::from(out)
    }

    fn deposit() -> Transaction {
        TransactionBuilder::new(TransactionType::Deposit, test_proof())
            .value(U256::from(10))
            .erc_address(word(0xaa))
            .token_id(U256::from(7))
            .commitments(vec![word(0x11)])
            .build()
    }

    #[test]
    fn hash_is_stable_across_rebuilds() {
        assert_eq!(deposit().transaction_hash(), deposit().transaction_hash());
    }

    #[test]
    fn check_hash_succeeds_after_construction() {
        assert!(deposit().check_hash());
    }

    #[test]
    fn tampered_wire_hash_is_detected() {
        let tampered = TransactionBuilder::new(TransactionType::Deposit, test_proof())
            .value(U256::from(10))
            .erc_address(word(0xaa))
            .token_id(U256::from(7))
            .commitments(vec![word(0x11)])
            .claimed_hash(word(0xff))
            .build();
        assert!(!tampered.check_hash());
    }

    #[test]
    fn arrays_are_zero_padded_to_arity() {
        let tx = deposit();
        assert_eq!(&[word(0x11), H256::zero()], tx.commitments());
        assert_eq!(&[H256::zero(); ARITY], tx.nullifiers());
        assert_eq!(vec![word(0x11)], tx.non_zero_commitments());
        assert!(tx.non_zero_nullifiers().is_empty());
    }

    #[test]
    fn any_field_mutation_invalidates_the_hash() {
        let base = deposit();
        let changed = TransactionBuilder::new(TransactionType::Deposit, test_proof())
            .value(U256::from(11))
            .erc_address(word(0xaa))
            .token_id(U256::from(7))
            .commitments(vec![word(0x11)])
            .build();
        assert_ne!(base.transaction_hash(), changed.transaction_hash());
    }

    #[test]
    fn transaction_round_trips_through_the_codec() {
        let tx = deposit();
        let decoded =
            Transaction::from_token(ethers::abi::decode(&[Transaction::param_type()], &tx.encode())
                .unwrap()
                .remove(0))
            .unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn deposit_public_inputs_match_the_documented_vector() {
        let tx = deposit();
        let inputs = tx.public_inputs(&[H256::zero(); ARITY]);
        assert_eq!(
            vec![
                U256::from_big_endian(word(0xaa).as_bytes()),
                U256::from(7),
                U256::from(10),
                U256::from_big_endian(word(0x11).as_bytes()),
            ],
            inputs,
        );
    }
}
