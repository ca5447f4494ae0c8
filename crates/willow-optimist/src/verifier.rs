//! The proof verification seam.
//!
//! The checker only needs a yes/no per (key, proof, public inputs).
//! Verification keys are whatever the ledger registered for each
//! transaction type, carried as the flat word array the contract stores.

use ark_bn254::{
    Bn254,
    Fq,
    Fq2,
    Fr,
    G1Affine,
    G2Affine,
};
use ark_ff::PrimeField as _;
use ark_groth16::{
    prepare_verifying_key,
    Groth16,
    Proof as Groth16Proof,
    VerifyingKey as Groth16Key,
};
use async_trait::async_trait;
use ethers::types::U256;
use willow_core::Proof;

/// An on-chain-registered verification key, opaque to this node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerificationKey(pub Vec<U256>);

#[derive(Debug, thiserror::Error)]
#[error("proof verifier unreachable: {0}")]
pub struct VerifierUnavailable(pub String);

#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Whether `proof` verifies against `key` over `public_inputs`. A
    /// transport failure is distinct from a failed verification and is
    /// fatal to the current check.
    async fn verify(
        &self,
        key: &VerificationKey,
        proof: &Proof,
        public_inputs: &[U256],
    ) -> Result<bool, VerifierUnavailable>;
}

/// In-process Groth16 verification over alt-bn128.
///
/// The registered key's word layout mirrors the on-chain verifier
/// contract: G1 alpha (2 words), G2 beta, gamma and delta (4 words each,
/// real component first), then one G1 input commitment per public input
/// plus one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Groth16Verifier;

/// Words ahead of the per-input commitment points in a flat key.
const KEY_FIXED_WORDS: usize = 14;

fn fq(word: U256) -> Fq {
    let mut buf = [0u8; 32];
    word.to_big_endian(&mut buf);
    Fq::from_be_bytes_mod_order(&buf)
}

fn fr(word: U256) -> Fr {
    let mut buf = [0u8; 32];
    word.to_big_endian(&mut buf);
    Fr::from_be_bytes_mod_order(&buf)
}

fn g1_unchecked(x: U256, y: U256) -> G1Affine {
    G1Affine::new_unchecked(fq(x), fq(y))
}

fn g2_unchecked(words: &[U256]) -> G2Affine {
    let x = Fq2::new(fq(words[0]), fq(words[1]));
    let y = Fq2::new(fq(words[2]), fq(words[3]));
    G2Affine::new_unchecked(x, y)
}

fn g1_checked(x: U256, y: U256) -> Option<G1Affine> {
    let point = g1_unchecked(x, y);
    (point.is_on_curve() && point.is_in_correct_subgroup_assuming_on_curve()).then_some(point)
}

fn g2_checked(words: [U256; 4]) -> Option<G2Affine> {
    let point = g2_unchecked(&words);
    (point.is_on_curve() && point.is_in_correct_subgroup_assuming_on_curve()).then_some(point)
}

/// The key was registered on chain, so its points are taken as given; only
/// the word count is checked against the expected shape.
fn parse_key(
    key: &VerificationKey,
    public_inputs: usize,
) -> Result<Groth16Key<Bn254>, VerifierUnavailable> {
    let words = &key.0;
    let commitment_words = words
        .len()
        .checked_sub(KEY_FIXED_WORDS)
        .filter(|n| n % 2 == 0 && *n > 0)
        .ok_or_else(|| {
            VerifierUnavailable(format!(
                "verification key holds {} words; expected {KEY_FIXED_WORDS} plus G1 input \
                 commitments",
                words.len(),
            ))
        })?;
    if commitment_words / 2 != public_inputs + 1 {
        return Err(VerifierUnavailable(format!(
            "verification key carries {} input commitments but the transaction has {} public \
             inputs",
            commitment_words / 2,
            public_inputs,
        )));
    }
    Ok(Groth16Key {
        alpha_g1: g1_unchecked(words[0], words[1]),
        beta_g2: g2_unchecked(&words[2..6]),
        gamma_g2: g2_unchecked(&words[6..10]),
        delta_g2: g2_unchecked(&words[10..14]),
        gamma_abc_g1: words[KEY_FIXED_WORDS..]
            .chunks(2)
            .map(|pair| g1_unchecked(pair[0], pair[1]))
            .collect(),
    })
}

#[async_trait]
impl ProofVerifier for Groth16Verifier {
    async fn verify(
        &self,
        key: &VerificationKey,
        proof: &Proof,
        public_inputs: &[U256],
    ) -> Result<bool, VerifierUnavailable> {
        let key = parse_key(key, public_inputs.len())?;
        // proof points are attacker-controlled calldata; a point off the
        // curve or outside the subgroup is simply a failed verification
        let elements = proof.elements();
        let Some(a) = g1_checked(elements[0], elements[1]) else {
            return Ok(false);
        };
        let Some(b) = g2_checked([elements[2], elements[3], elements[4], elements[5]]) else {
            return Ok(false);
        };
        let Some(c) = g1_checked(elements[6], elements[7]) else {
            return Ok(false);
        };
        let inputs: Vec<Fr> = public_inputs.iter().copied().map(fr).collect();
        let prepared = prepare_verifying_key(&key);
        Groth16::<Bn254>::verify_proof(
            &prepared,
            &Groth16Proof {
                a,
                b,
                c,
            },
            &inputs,
        )
        .map_err(|err| VerifierUnavailable(err.to_string()))
    }
}

/// Accepts every well-formed proof; lets the checker tests exercise the
/// taxonomy without real proving keys.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveVerifier;

#[cfg(test)]
#[async_trait]
impl ProofVerifier for PermissiveVerifier {
    async fn verify(
        &self,
        _key: &VerificationKey,
        _proof: &Proof,
        _public_inputs: &[U256],
    ) -> Result<bool, VerifierUnavailable> {
        Ok(true)
    }
}
