//! Groth16 proof points on alt-bn128 and their on-chain compression.
//!
//! Proofs travel compressed on the wire and inside every hash preimage: a G1
//! point keeps only its x coordinate with the parity of y stored in bit 255
//! (x fits in 254 bits, so the word has room). G2 points compress
//! component-wise over the extension field. Decompression recovers y from
//! the curve equation `y² = x³ + 3`; the base field prime satisfies
//! `p ≡ 3 (mod 4)`, so the square root is a single exponentiation by
//! `(p + 1) / 4`.

use ethers::types::U256;
use num_bigint::BigUint;
use serde::{
    Deserialize,
    Serialize,
};

/// alt-bn128 base field prime.
const FIELD_PRIME: &str =
    "21888242871839275222246405745257275088696311157297823662689037894645226208583";

/// alt-bn128 scalar field order, the modulus of circuit public inputs.
const SCALAR_FIELD: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

/// Number of field elements in an uncompressed proof: G1 a, G2 b, G1 c.
pub const PROOF_LEN: usize = 8;

/// Number of words in a compressed proof.
pub const COMPRESSED_PROOF_LEN: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CurveError {
    #[error("x coordinate is not an element of the base field")]
    NotInField,
    #[error("x coordinate is not on the curve (x^3 + 3 is a non-residue)")]
    NotOnCurve,
}

fn field_prime() -> BigUint {
    FIELD_PRIME
        .parse()
        .expect("the alt-bn128 prime is a valid decimal literal")
}

fn to_biguint(x: U256) -> BigUint {
    let mut buf = [0u8; 32];
    x.to_big_endian(&mut buf);
    BigUint::from_bytes_be(&buf)
}

fn to_u256(x: &BigUint) -> U256 {
    U256::from_big_endian(&x.to_bytes_be())
}

/// Whether `value` is a canonical scalar field element, i.e. strictly below
/// the circuit field order. Public inputs are reduced modulo this order on
/// chain, so an out-of-range word would alias a smaller one.
#[must_use]
pub fn is_scalar_field_element(value: U256) -> bool {
    let order = U256::from_dec_str(SCALAR_FIELD)
        .expect("the alt-bn128 scalar order is a valid decimal literal");
    value < order
}

/// Compresses a G1 point: x with the parity of y in bit 255.
#[must_use]
pub fn compress_g1(x: U256, y: U256) -> U256 {
    let parity = y.bit(0);
    let mut compressed = x;
    if parity {
        compressed = compressed | (U256::one() << 255);
    }
    compressed
}

/// Recovers a G1 point from its compressed form.
///
/// # Errors
/// Returns an error if x is not a base-field element or not on the curve.
pub fn decompress_g1(compressed: U256) -> Result<(U256, U256), CurveError> {
    let parity = compressed.bit(255);
    let x = compressed & !(U256::one() << 255);
    let p = field_prime();
    let x_big = to_biguint(x);
    if x_big >= p {
        return Err(CurveError::NotInField);
    }
    // y² = x³ + 3
    let y_squared = (x_big.modpow(&BigUint::from(3u8), &p) + BigUint::from(3u8)) % &p;
    // p ≡ 3 (mod 4), so a square root, if one exists, is c^((p + 1) / 4)
    let exponent = (&p + BigUint::from(1u8)) >> 2;
    let mut y = y_squared.modpow(&exponent, &p);
    if y.modpow(&BigUint::from(2u8), &p) != y_squared {
        return Err(CurveError::NotOnCurve);
    }
    if (y.bit(0)) != parity {
        y = &p - y;
    }
    Ok((x, to_u256(&y)))
}

/// An uncompressed Groth16 proof: `[a.x, a.y, b.x_r, b.x_i, b.y_r, b.y_i,
/// c.x, c.y]`, the order the external verifier consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    elements: [U256; PROOF_LEN],
}

/// The 4-word compressed form carried on-chain and inside hash preimages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedProof {
    words: [U256; COMPRESSED_PROOF_LEN],
}

impl Proof {
    #[must_use]
    pub fn new(elements: [U256; PROOF_LEN]) -> Self {
        Self {
            elements,
        }
    }

    #[must_use]
    pub fn elements(&self) -> &[U256; PROOF_LEN] {
        &self.elements
    }

    /// Compresses the proof: G1 points drop y, the G2 point compresses its
    /// real and imaginary components separately.
    #[must_use]
    pub fn compress(&self) -> CompressedProof {
        let [ax, ay, bxr, bxi, byr, byi, cx, cy] = self.elements;
        CompressedProof {
            words: [
                compress_g1(ax, ay),
                compress_g1(bxr, byr),
                compress_g1(bxi, byi),
                compress_g1(cx, cy),
            ],
        }
    }

    /// Recovers the full proof from its compressed form.
    ///
    /// # Errors
    /// Returns an error if any word does not decompress to a curve point.
    pub fn decompress(compressed: &CompressedProof) -> Result<Self, CurveError> {
        let [a, br, bi, c] = compressed.words;
        let (ax, ay) = decompress_g1(a)?;
        let (bxr, byr) = decompress_g1(br)?;
        let (bxi, byi) = decompress_g1(bi)?;
        let (cx, cy) = decompress_g1(c)?;
        Ok(Self {
            elements: [ax, ay, bxr, bxi, byr, byi, cx, cy],
        })
    }
}

impl CompressedProof {
    #[must_use]
    pub fn new(words: [U256; COMPRESSED_PROOF_LEN]) -> Self {
        Self {
            words,
        }
    }

    #[must_use]
    pub fn words(&self) -> &[U256; COMPRESSED_PROOF_LEN] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a known alt-bn128 point: the generator (1, 2) and a couple of doublings
    fn generator() -> (U256, U256) {
        (U256::from(1), U256::from(2))
    }

    #[test]
    fn g1_compression_round_trips() {
        let (x, y) = generator();
        let compressed = compress_g1(x, y);
        assert_eq!((x, y), decompress_g1(compressed).unwrap());
    }

    #[test]
    fn g1_compression_round_trips_odd_parity() {
        // -G = (1, p - 2) has odd y
        let p: BigUint = FIELD_PRIME.parse().unwrap();
        let y = to_u256(&(&p - BigUint::from(2u8)));
        let x = U256::from(1);
        let compressed = compress_g1(x, y);
        assert!(compressed.bit(255));
        assert_eq!((x, y), decompress_g1(compressed).unwrap());
    }

    #[test]
    fn off_curve_x_is_rejected() {
        // x = 4: 4^3 + 3 = 67 is a quadratic non-residue mod p
        let err = decompress_g1(U256::from(4)).unwrap_err();
        assert_eq!(CurveError::NotOnCurve, err);
    }

    #[test]
    fn out_of_field_x_is_rejected() {
        let p: BigUint = FIELD_PRIME.parse().unwrap();
        let err = decompress_g1(to_u256(&p)).unwrap_err();
        assert_eq!(CurveError::NotInField, err);
    }

    #[test]
    fn proof_round_trips_through_compression() {
        let (x, y) = generator();
        let p: BigUint = FIELD_PRIME.parse().unwrap();
        let neg_y = to_u256(&(&p - BigUint::from(2u8)));
        let proof = Proof::new([x, y, x, x, y, neg_y, x, neg_y]);
        let recovered = Proof::decompress(&proof.compress()).unwrap();
        assert_eq!(proof, recovered);
    }
}
