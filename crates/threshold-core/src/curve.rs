//! secp256k1 helpers: point encoding, aggregation and address derivation

use crate::{Error, Result};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use num_bigint::BigUint;
use tiny_keccak::{Hasher, Keccak};

/// Decode a SEC1 point (compressed or uncompressed)
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::VerificationFailed(e.to_string()))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::VerificationFailed("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Compressed SEC1 encoding
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Uncompressed SEC1 encoding
pub fn encode_point_uncompressed(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// Sum of SEC1-encoded points
pub fn sum_points<'a, I>(points: I) -> Result<ProjectivePoint>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    points
        .into_iter()
        .try_fold(ProjectivePoint::IDENTITY, |acc, bytes| Ok(acc + decode_point(bytes)?))
}

/// Reduce a field element into a secp256k1 scalar
pub fn scalar_from_biguint(value: &BigUint) -> Result<Scalar> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(Error::Crypto(format!(
            "scalar too large: {} bytes",
            bytes.len()
        )));
    }
    let mut array = [0u8; 32];
    array[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

pub fn biguint_from_scalar(scalar: &Scalar) -> BigUint {
    BigUint::from_bytes_be(&scalar.to_bytes())
}

/// Reduce 32 big-endian bytes into a scalar
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization(format!("Invalid scalar length: {}", bytes.len())))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

/// `0x`-prefixed Keccak-256 address of a public key
pub fn address(point: &ProjectivePoint) -> String {
    let uncompressed = encode_point_uncompressed(point);
    let mut hasher = Keccak::v256();
    hasher.update(&uncompressed[1..]);
    let mut digest = [0u8; 32];
    hasher.finalize(&mut digest);
    format!("0x{}", hex::encode(&digest[12..]))
}
