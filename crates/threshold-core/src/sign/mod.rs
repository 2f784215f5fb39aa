//! Signature combination and verification
//!
//! Two paths produce a signature over the group key:
//! - the reconstruction path interpolates `K` raw shares back into the joint
//!   secret and signs with ordinary single-party ECDSA (RFC 6979), so every
//!   `K`-subset yields the same signature;
//! - the threshold path sums TSS engine fragments (see [`crate::tss`]).

use crate::curve::{decode_point, scalar_from_biguint};
use crate::sharing::{PrimeField, Share};
use crate::{Error, Result, Signature};
use k256::{
    ecdsa::{signature::hazmat::PrehashVerifier, SigningKey, VerifyingKey},
    ProjectivePoint, Scalar,
};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

/// SHA-256 of the raw message
pub fn message_hash(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

/// Verify an ECDSA signature over `hash` against a SEC1 group key
pub fn verify_signature(group_key: &[u8], hash: &[u8; 32], signature: &Signature) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_sec1_bytes(group_key).map_err(|e| Error::Crypto(e.to_string()))?;
    let signature = signature.to_ecdsa()?;
    verifying_key
        .verify_prehash(hash, &signature)
        .map_err(|e| Error::VerificationFailed(e.to_string()))
}

/// Single-party ECDSA with an RFC 6979 nonce
pub fn sign_with_secret(secret: &Scalar, hash: &[u8; 32]) -> Result<Signature> {
    let signing_key =
        SigningKey::from_bytes(&secret.to_bytes()).map_err(|e| Error::Crypto(e.to_string()))?;
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(hash)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(Signature::from_ecdsa(&signature, recovery_id.to_byte()))
}

/// Reconstruct the joint secret from `shares` and sign `hash` with it.
///
/// The recovered secret must match `group_key`; any mismatch is reported as
/// `VerificationFailed` rather than producing a signature.
#[instrument(skip(shares, hash), fields(shares = shares.len()))]
pub fn combine_reconstruction(
    group_key: &[u8],
    shares: &[Share],
    threshold: usize,
    hash: &[u8; 32],
) -> Result<Signature> {
    let field = PrimeField::secp256k1();
    let secret = scalar_from_biguint(&field.reconstruct_secret(shares, threshold)?)?;

    if ProjectivePoint::GENERATOR * secret != decode_point(group_key)? {
        return Err(Error::VerificationFailed(
            "reconstructed secret does not match the group key".into(),
        ));
    }

    let signature = sign_with_secret(&secret, hash)?;
    verify_signature(group_key, hash, &signature)?;

    debug!(r = hex::encode(signature.r), "Reconstruction signature verified");
    Ok(signature)
}
