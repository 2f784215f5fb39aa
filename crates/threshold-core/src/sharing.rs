//! Polynomial secret sharing over a prime field
//!
//! Pure arithmetic over `Z_q`: polynomial generation, Horner evaluation,
//! coefficient-wise summation, modular inverse and Lagrange interpolation.
//! No I/O happens here.

use crate::{Error, PartyIndex, Result};
use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// secp256k1 group order, big-endian
const SECP256K1_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// Polynomial with coefficients in `Z_q`, lowest degree first.
///
/// Coefficient 0 is the owner's contribution to the joint secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polynomial {
    #[serde(with = "biguint_hex::vec")]
    coefficients: Vec<BigUint>,
}

impl Polynomial {
    /// Build a polynomial from raw coefficients, lowest degree first
    pub fn from_coefficients(coefficients: Vec<BigUint>) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[BigUint] {
        &self.coefficients
    }

    /// Number of coefficients (`K` for a degree `K-1` polynomial)
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// The degree-0 term
    pub fn constant_term(&self) -> Option<&BigUint> {
        self.coefficients.first()
    }
}

/// An evaluation point `(x, y)`; `x` is `PartyIndex + 1`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub x: u64,
    #[serde(with = "biguint_hex")]
    pub y: BigUint,
}

impl Share {
    pub fn new(x: u64, y: BigUint) -> Self {
        Self { x, y }
    }

    /// Party index that owns this evaluation point
    pub fn party_index(&self) -> Option<PartyIndex> {
        self.x.checked_sub(1).map(|i| i as PartyIndex)
    }
}

/// x-coordinate used for a party; 0 is reserved for the secret
pub fn x_coordinate(party_index: PartyIndex) -> u64 {
    party_index as u64 + 1
}

/// Arithmetic context for `Z_q`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeField {
    modulus: BigUint,
}

impl PrimeField {
    /// Create a field with the given (prime) order
    pub fn new(modulus: BigUint) -> Result<Self> {
        if modulus < BigUint::from(2u32) {
            return Err(Error::InvalidConfig(format!(
                "field order must be at least 2, got {}",
                modulus
            )));
        }
        Ok(Self { modulus })
    }

    /// The secp256k1 scalar field
    pub fn secp256k1() -> Self {
        Self {
            modulus: BigUint::from_bytes_be(&SECP256K1_ORDER),
        }
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Reduce a value into `[0, q)`
    pub fn element(&self, value: impl Into<BigUint>) -> BigUint {
        value.into() % &self.modulus
    }

    /// Uniform element of `[0, q)`
    pub fn random_element<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BigUint {
        rng.gen_biguint_below(&self.modulus)
    }

    fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a % &self.modulus + &self.modulus - b % &self.modulus) % &self.modulus
    }

    /// Draw `threshold` independent coefficients, i.e. a degree `threshold - 1` polynomial
    pub fn generate_polynomial<R: RngCore + CryptoRng>(
        &self,
        threshold: usize,
        rng: &mut R,
    ) -> Result<Polynomial> {
        if threshold == 0 {
            return Err(Error::InvalidConfig("threshold must be at least 1".into()));
        }
        let coefficients = (0..threshold).map(|_| self.random_element(rng)).collect();
        Ok(Polynomial { coefficients })
    }

    /// Horner evaluation of `poly` at `x`
    pub fn evaluate(&self, poly: &Polynomial, x: &BigUint) -> BigUint {
        let x = x % &self.modulus;
        poly.coefficients
            .iter()
            .rev()
            .fold(BigUint::zero(), |acc, coefficient| {
                (acc * &x + coefficient) % &self.modulus
            })
    }

    /// Evaluate at a party's x-coordinate
    pub fn share_for(&self, poly: &Polynomial, party_index: PartyIndex) -> Share {
        let x = x_coordinate(party_index);
        Share::new(x, self.evaluate(poly, &BigUint::from(x)))
    }

    /// Coefficient-wise sum; every input must have the same length
    pub fn sum_polynomials(&self, polys: &[Polynomial]) -> Result<Polynomial> {
        let first = polys
            .first()
            .ok_or_else(|| Error::InvalidConfig("no polynomials to sum".into()))?;
        let len = first.len();

        if let Some(bad) = polys.iter().find(|p| p.len() != len) {
            return Err(Error::InvalidConfig(format!(
                "polynomial length mismatch: expected {}, got {}",
                len,
                bad.len()
            )));
        }

        let coefficients = (0..len)
            .map(|i| {
                polys
                    .iter()
                    .fold(BigUint::zero(), |acc, p| (acc + &p.coefficients[i]) % &self.modulus)
            })
            .collect();
        Ok(Polynomial { coefficients })
    }

    /// Inverse of `a` in this field
    pub fn inverse(&self, a: &BigUint) -> Result<BigUint> {
        mod_inverse(a, &self.modulus)
    }

    /// Value at `at_x` of the unique polynomial of degree `< points.len()`
    /// passing through `points`.
    ///
    /// x-coordinates must be pairwise distinct modulo `q`.
    pub fn lagrange_interpolate(&self, points: &[Share], at_x: &BigUint) -> Result<BigUint> {
        if points.is_empty() {
            return Err(Error::InsufficientParticipants { required: 1, actual: 0 });
        }

        let mut seen = HashSet::with_capacity(points.len());
        for point in points {
            if !seen.insert(self.element(point.x)) {
                return Err(Error::DuplicateXCoordinate(point.x));
            }
        }

        let mut result = BigUint::zero();
        for (i, point_i) in points.iter().enumerate() {
            let x_i = BigUint::from(point_i.x);
            let mut numerator = BigUint::one();
            let mut denominator = BigUint::one();

            for (j, point_j) in points.iter().enumerate() {
                if i == j {
                    continue;
                }
                let x_j = BigUint::from(point_j.x);
                numerator = numerator * self.sub(at_x, &x_j) % &self.modulus;
                denominator = denominator * self.sub(&x_i, &x_j) % &self.modulus;
            }

            let basis = numerator * self.inverse(&denominator)? % &self.modulus;
            result = (result + &point_i.y * basis) % &self.modulus;
        }

        Ok(result)
    }

    /// Recover the constant term from at least `threshold` shares
    pub fn reconstruct_secret(&self, points: &[Share], threshold: usize) -> Result<BigUint> {
        if points.len() < threshold {
            return Err(Error::InsufficientParticipants {
                required: threshold,
                actual: points.len(),
            });
        }
        self.lagrange_interpolate(points, &BigUint::zero())
    }
}

/// Extended Euclidean inverse of `a` modulo `m`
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Result<BigUint> {
    let modulus = BigInt::from_biguint(Sign::Plus, m.clone());
    let (mut old_r, mut r) = (BigInt::from_biguint(Sign::Plus, a % m), modulus.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let quotient = &old_r / &r;
        let next_r = &old_r - &quotient * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &quotient * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    if !old_r.is_one() {
        return Err(Error::NonInvertible);
    }

    old_s
        .mod_floor(&modulus)
        .to_biguint()
        .ok_or_else(|| Error::Internal("negative inverse after reduction".into()))
}

/// Hex (de)serialization for field elements
pub(crate) mod biguint_hex {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(16))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<BigUint, String> {
        BigUint::parse_bytes(s.as_bytes(), 16).ok_or_else(|| format!("invalid hex scalar: {}", s))
    }

    pub mod vec {
        use num_bigint::BigUint;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(values: &[BigUint], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_seq(values.iter().map(|v| v.to_str_radix(16)))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<BigUint>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Vec::<String>::deserialize(deserializer)?
                .iter()
                .map(|s| super::parse(s).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}
