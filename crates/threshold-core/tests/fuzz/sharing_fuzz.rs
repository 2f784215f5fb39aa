//! Fuzz tests for the Secret Sharing Engine
//!
//! Property-based testing of the field arithmetic: evaluation homomorphism,
//! modular inverses, reconstruction from any `K`-subset and group-key
//! aggregation.

use k256::{ProjectivePoint, Scalar};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use proptest::prelude::*;
use threshold_core::{
    curve::{encode_point, scalar_from_biguint, sum_points},
    identity::PersistentSeed,
    sharing::{mod_inverse, Polynomial, PrimeField, Share},
    Error,
};

// ============================================================================
// Strategies for generating test data
// ============================================================================

/// 256-bit value reduced into the secp256k1 scalar field
fn element_strategy() -> impl Strategy<Value = BigUint> {
    prop::array::uniform32(any::<u8>())
        .prop_map(|bytes| BigUint::from_bytes_be(&bytes) % PrimeField::secp256k1().modulus())
}

/// Polynomial with `threshold` coefficients
fn polynomial_strategy(threshold: usize) -> impl Strategy<Value = Polynomial> {
    prop::collection::vec(element_strategy(), threshold).prop_map(Polynomial::from_coefficients)
}

/// Between 2 and 5 polynomials of one shared length in 2..=4
fn polynomial_set_strategy() -> impl Strategy<Value = Vec<Polynomial>> {
    (2usize..=4).prop_flat_map(|threshold| {
        prop::collection::vec(polynomial_strategy(threshold), 2..=5)
    })
}

// ============================================================================
// Field arithmetic
// ============================================================================

proptest! {
    /// evaluate(Σ P_i, x) == Σ evaluate(P_i, x) mod q
    #[test]
    fn evaluation_is_homomorphic(polys in polynomial_set_strategy(), x in element_strategy()) {
        let field = PrimeField::secp256k1();
        let combined = field.sum_polynomials(&polys).unwrap();

        let separately = polys
            .iter()
            .fold(BigUint::zero(), |acc, p| (acc + field.evaluate(p, &x)) % field.modulus());

        prop_assert_eq!(field.evaluate(&combined, &x), separately);
    }

    /// a · a⁻¹ == 1 mod q for a in [1, q)
    #[test]
    fn mod_inverse_is_inverse(a in element_strategy()) {
        prop_assume!(!a.is_zero());
        let q = PrimeField::secp256k1().modulus().clone();

        let inverse = mod_inverse(&a, &q).unwrap();
        prop_assert!(inverse < q);
        prop_assert_eq!((a * inverse) % &q, BigUint::one());
    }

    /// Small prime field, every nonzero element
    #[test]
    fn mod_inverse_small_field(a in 1u32..97) {
        let q = BigUint::from(97u32);
        let inverse = mod_inverse(&BigUint::from(a), &q).unwrap();
        prop_assert_eq!((BigUint::from(a) * inverse) % &q, BigUint::one());
    }

    /// Multiples of the modulus have no inverse
    #[test]
    fn mod_inverse_rejects_multiples(k in 0u32..50) {
        let q = BigUint::from(97u32);
        prop_assert!(matches!(
            mod_inverse(&(BigUint::from(k) * &q), &q),
            Err(Error::NonInvertible)
        ));
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

proptest! {
    /// Any K of N shares interpolate to the constant term
    #[test]
    fn any_k_subset_reconstructs(
        poly in polynomial_strategy(3),
        subset in prop::sample::subsequence((0usize..6).collect::<Vec<_>>(), 3),
    ) {
        let field = PrimeField::secp256k1();
        let shares: Vec<Share> = subset.iter().map(|&p| field.share_for(&poly, p)).collect();

        let secret = field.reconstruct_secret(&shares, 3).unwrap();
        prop_assert_eq!(Some(&secret), poly.constant_term());
    }

    /// Fewer than K shares are refused outright
    #[test]
    fn below_threshold_refused(poly in polynomial_strategy(4), count in 0usize..4) {
        let field = PrimeField::secp256k1();
        let shares: Vec<Share> = (0..count).map(|p| field.share_for(&poly, p)).collect();

        let refused = matches!(
            field.reconstruct_secret(&shares, 4),
            Err(Error::InsufficientParticipants { required: 4, .. })
        );
        prop_assert!(refused);
    }

    /// A repeated x-coordinate is rejected, never silently dropped
    #[test]
    fn repeated_x_rejected(poly in polynomial_strategy(2), party in 0usize..10) {
        let field = PrimeField::secp256k1();
        let share = field.share_for(&poly, party);

        let rejected = matches!(
            field.lagrange_interpolate(&[share.clone(), share], &BigUint::zero()),
            Err(Error::DuplicateXCoordinate(_))
        );
        prop_assert!(rejected);
    }
}

// ============================================================================
// Curve and identity
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Σ(share_i·G) == (Σ share_i)·G
    #[test]
    fn group_key_is_homomorphic(shares in prop::collection::vec(element_strategy(), 1..6)) {
        let scalars: Vec<Scalar> = shares.iter().map(|s| scalar_from_biguint(s).unwrap()).collect();

        let points: Vec<Vec<u8>> = scalars
            .iter()
            .map(|s| encode_point(&(ProjectivePoint::GENERATOR * s)))
            .collect();
        let summed_points = sum_points(points.iter().map(Vec::as_slice)).unwrap();
        let summed_scalars = scalars.iter().fold(Scalar::ZERO, |acc, s| acc + s);

        prop_assert_eq!(summed_points, ProjectivePoint::GENERATOR * summed_scalars);
    }

    /// Same seed and index, different sessions: different shares
    #[test]
    fn derivation_is_session_scoped(
        seed in prop::array::uniform32(any::<u8>()),
        a in "[a-z0-9-]{1,24}",
        b in "[a-z0-9-]{1,24}",
        party in 0usize..16,
    ) {
        prop_assume!(a != b);
        let seed = PersistentSeed::from_bytes(seed);
        prop_assert_ne!(seed.derive(&a, party).unwrap(), seed.derive(&b, party).unwrap());
    }
}
