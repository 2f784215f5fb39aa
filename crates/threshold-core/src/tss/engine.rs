//! Reference TSS engine driven through the rendezvous transport
//!
//! Setup reshares each party's session scalar with Feldman VSS so any `K`
//! parties hold Shamir shares of the joint secret. Signing follows the GG18
//! shape: joint nonce `k`, blinding `γ`, multiplicative-to-additive (MtA)
//! conversion of `k·γ` and `k·x`, then `s_i = m·k_i + r·σ_i`.
//!
//! The MtA step here is a plaintext stand-in: each signer sends its `k_i` to
//! its peers in the clear. A production engine fills this slot with a
//! Paillier- or OT-based MtA. Until then, any signer that sees every `k_j` and
//! the final signature can solve for the joint secret.

use super::{EngineContext, Presignature, TssEngine};
use crate::curve::{decode_point, encode_point, scalar_from_bytes, sum_points};
use crate::messages::{FragmentPayload, SignatureFragment};
use crate::sign::verify_signature;
use crate::{Error, KeyShare, PartyIndex, Result, Scheme, Signature};
use k256::{
    ecdsa,
    elliptic_curve::{bigint::U256, ops::Reduce, sec1::ToEncodedPoint, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// Feldman VSS round: commitments plus the recipient's share
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VssMessage {
    from: PartyIndex,
    commitments: Vec<Vec<u8>>,
    share: Vec<u8>,
}

/// MtA request carrying the sender's nonce share
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MtaRequest {
    from: PartyIndex,
    k_share: Vec<u8>,
}

/// MtA response: the requester's additive halves of `k_j·γ_i` and `k_j·w_i`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MtaReply {
    from: PartyIndex,
    alpha_gamma: Vec<u8>,
    alpha_w: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeltaMessage {
    from: PartyIndex,
    delta: Vec<u8>,
    gamma_point: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineFragment {
    r_point: Vec<u8>,
    sigma: Vec<u8>,
}

fn vss_kind(from: PartyIndex) -> String {
    format!("tss/vss/{}", from)
}

fn round_kind(request_id: &str, step: &str, from: PartyIndex) -> String {
    format!("tss/{}/{}/{}", request_id, step, from)
}

/// In-tree TSS engine
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayTssEngine;

impl RelayTssEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl TssEngine for RelayTssEngine {
    #[instrument(skip_all, fields(session_id = ctx.session_id, party_index = ctx.party_index))]
    async fn setup(
        &self,
        ctx: &EngineContext<'_>,
        share: Scalar,
        group_key: &[u8],
    ) -> Result<KeyShare> {
        debug!("TSS setup: Feldman reshare");
        let (poly, commitments) = generate_secret_polynomial(share, ctx.threshold);

        for peer in 0..ctx.total_parties {
            if peer == ctx.party_index {
                continue;
            }
            let message = VssMessage {
                from: ctx.party_index,
                commitments: commitments.clone(),
                share: evaluate_polynomial(&poly, peer as u64 + 1).to_bytes().to_vec(),
            };
            ctx.send(peer, &vss_kind(ctx.party_index), &message).await?;
        }

        let mut all_commitments = vec![Vec::new(); ctx.total_parties];
        all_commitments[ctx.party_index] = commitments;
        let mut secret_share = evaluate_polynomial(&poly, ctx.party_index as u64 + 1);

        for peer in 0..ctx.total_parties {
            if peer == ctx.party_index {
                continue;
            }
            let message: VssMessage = ctx.recv(peer, &vss_kind(peer)).await?;
            if message.from != peer || message.commitments.len() != ctx.threshold {
                return Err(Error::VerificationFailed(format!(
                    "malformed VSS message from party {}",
                    peer
                )));
            }
            let received = scalar_from_bytes(&message.share)?;
            verify_share(&received, &message.commitments, ctx.party_index, peer)?;
            secret_share += received;
            all_commitments[peer] = message.commitments;
        }

        let combined = sum_points(all_commitments.iter().map(|c| c[0].as_slice()))?;
        if combined != decode_point(group_key)? {
            return Err(Error::VerificationFailed(
                "VSS constant terms do not sum to the group key".into(),
            ));
        }

        let public_shares = compute_public_shares(&all_commitments, ctx.total_parties)?;
        let key = KeyShare {
            session_id: ctx.session_id.to_string(),
            party_index: ctx.party_index,
            total_parties: ctx.total_parties,
            threshold: ctx.threshold,
            scheme: Scheme::Threshold,
            secret_share,
            group_key: encode_point(&combined),
            address: crate::curve::address(&combined),
            public_shares,
        };
        key.verify_public_share()?;

        info!(address = %key.address, "TSS setup complete");
        Ok(key)
    }

    #[instrument(skip(self, ctx, key), fields(party_index = ctx.party_index))]
    async fn precompute(
        &self,
        ctx: &EngineContext<'_>,
        key: &KeyShare,
        request_id: &str,
        signers: &[PartyIndex],
    ) -> Result<Presignature> {
        if signers.len() < key.threshold {
            return Err(Error::InsufficientParticipants {
                required: key.threshold,
                actual: signers.len(),
            });
        }
        check_distinct(signers)?;
        if !signers.contains(&ctx.party_index) {
            return Err(Error::InvalidPartyIndex(ctx.party_index));
        }
        let me = ctx.party_index;
        let peers: Vec<PartyIndex> = signers.iter().copied().filter(|&p| p != me).collect();

        let mut rng = OsRng;
        let k_i = Scalar::random(&mut rng);
        let gamma_i = Scalar::random(&mut rng);
        let w_i = key.secret_share * compute_lagrange_coefficient(me, signers)?;

        debug!("Precompute round 1: MtA requests");
        let request = MtaRequest {
            from: me,
            k_share: k_i.to_bytes().to_vec(),
        };
        for &peer in &peers {
            ctx.send(peer, &round_kind(request_id, "mta", me), &request).await?;
        }

        let mut delta_i = k_i * gamma_i;
        let mut sigma_i = k_i * w_i;

        for &peer in &peers {
            let request: MtaRequest = ctx.recv(peer, &round_kind(request_id, "mta", peer)).await?;
            let k_j = scalar_from_bytes(&request.k_share)?;
            let beta = Scalar::random(&mut rng);
            let beta_w = Scalar::random(&mut rng);
            let reply = MtaReply {
                from: me,
                alpha_gamma: (k_j * gamma_i - beta).to_bytes().to_vec(),
                alpha_w: (k_j * w_i - beta_w).to_bytes().to_vec(),
            };
            ctx.send(peer, &round_kind(request_id, "mta-reply", me), &reply).await?;
            delta_i += beta;
            sigma_i += beta_w;
        }

        debug!("Precompute round 2: MtA replies");
        for &peer in &peers {
            let reply: MtaReply = ctx.recv(peer, &round_kind(request_id, "mta-reply", peer)).await?;
            delta_i += scalar_from_bytes(&reply.alpha_gamma)?;
            sigma_i += scalar_from_bytes(&reply.alpha_w)?;
        }

        debug!("Precompute round 3: delta");
        let gamma_point = ProjectivePoint::GENERATOR * gamma_i;
        let own = DeltaMessage {
            from: me,
            delta: delta_i.to_bytes().to_vec(),
            gamma_point: encode_point(&gamma_point),
        };
        for &peer in &peers {
            ctx.send(peer, &round_kind(request_id, "delta", me), &own).await?;
        }

        let mut delta = delta_i;
        let mut gamma = gamma_point;
        for &peer in &peers {
            let message: DeltaMessage =
                ctx.recv(peer, &round_kind(request_id, "delta", peer)).await?;
            delta += scalar_from_bytes(&message.delta)?;
            gamma += decode_point(&message.gamma_point)?;
        }

        let delta_inv = Option::<Scalar>::from(delta.invert()).ok_or(Error::NonInvertible)?;
        let r_point = gamma * delta_inv;

        Ok(Presignature {
            request_id: request_id.to_string(),
            signers: signers.to_vec(),
            r_point: encode_point(&r_point),
            k_share: k_i,
            sigma_share: sigma_i,
        })
    }

    fn partial_sign(
        &self,
        _key: &KeyShare,
        presignature: &Presignature,
        hash: &[u8; 32],
    ) -> Result<Vec<u8>> {
        let r = r_scalar(&decode_point(&presignature.r_point)?);
        let m = <Scalar as Reduce<U256>>::reduce_bytes(&(*hash).into());

        // s_i = m·k_i + r·σ_i, summing to k·(m + r·x)
        let sigma = m * presignature.k_share + r * presignature.sigma_share;

        let fragment = EngineFragment {
            r_point: presignature.r_point.clone(),
            sigma: sigma.to_bytes().to_vec(),
        };
        Ok(serde_json::to_vec(&fragment)?)
    }

    fn combine(
        &self,
        group_key: &[u8],
        fragments: &[SignatureFragment],
        hash: &[u8; 32],
    ) -> Result<Signature> {
        let mut r_point: Option<Vec<u8>> = None;
        let mut s = Scalar::ZERO;

        for fragment in fragments {
            let FragmentPayload::Engine { data } = &fragment.payload else {
                return Err(Error::VerificationFailed(format!(
                    "party {} sent a non-engine fragment",
                    fragment.party_index
                )));
            };
            let parsed: EngineFragment = serde_json::from_slice(data)
                .map_err(|e| Error::Deserialization(e.to_string()))?;

            match &r_point {
                None => r_point = Some(parsed.r_point),
                Some(existing) if *existing != parsed.r_point => {
                    return Err(Error::VerificationFailed(format!(
                        "party {} used a different nonce point",
                        fragment.party_index
                    )));
                }
                Some(_) => {}
            }
            s += scalar_from_bytes(&parsed.sigma)?;
        }

        let r_point = r_point.ok_or(Error::InsufficientParticipants { required: 1, actual: 0 })?;
        let r_affine = decode_point(&r_point)?.to_affine();
        let r_encoded = r_affine.to_encoded_point(false);
        let r: [u8; 32] = r_encoded.as_bytes()[1..33]
            .try_into()
            .map_err(|_| Error::Internal("Invalid r length".into()))?;

        // Recovery ID from R's y parity, flipped if s is normalized to low-s
        let mut recovery_id = u8::from(r_affine.to_encoded_point(true).as_bytes()[0] == 0x03);
        let r_bytes = k256::FieldBytes::clone_from_slice(&r);
        let signature = ecdsa::Signature::from_scalars(r_bytes, s.to_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let signature = match signature.normalize_s() {
            Some(normalized) => {
                recovery_id ^= 1;
                normalized
            }
            None => signature,
        };

        let signature = Signature::from_ecdsa(&signature, recovery_id);
        verify_signature(group_key, hash, &signature)?;
        Ok(signature)
    }
}

/// Polynomial with the given constant term and random higher coefficients,
/// plus Feldman commitments to every coefficient
fn generate_secret_polynomial(constant: Scalar, threshold: usize) -> (Vec<Scalar>, Vec<Vec<u8>>) {
    let mut rng = OsRng;
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(constant);
    for _ in 1..threshold {
        coefficients.push(Scalar::random(&mut rng));
    }

    let commitments = coefficients
        .iter()
        .map(|c| encode_point(&(ProjectivePoint::GENERATOR * c)))
        .collect();

    (coefficients, commitments)
}

/// Evaluate polynomial at a point
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x = Scalar::from(x);
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Evaluate the committed polynomial `Σ C_k·x^k` in the exponent
fn evaluate_commitments(commitments: &[Vec<u8>], x: u64) -> Result<ProjectivePoint> {
    let x = Scalar::from(x);
    let mut result = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for commitment in commitments {
        result += decode_point(commitment)? * x_power;
        x_power *= x;
    }

    Ok(result)
}

/// Verify a share against the sender's commitments
fn verify_share(
    share: &Scalar,
    commitments: &[Vec<u8>],
    my_index: PartyIndex,
    from: PartyIndex,
) -> Result<()> {
    let expected = ProjectivePoint::GENERATOR * share;
    let actual = evaluate_commitments(commitments, my_index as u64 + 1)?;

    if expected != actual {
        return Err(Error::VerificationFailed(format!(
            "Share from party {} does not match commitment",
            from
        )));
    }

    Ok(())
}

/// `x_j·G` for every party, from everyone's commitments
fn compute_public_shares(
    all_commitments: &[Vec<Vec<u8>>],
    total_parties: usize,
) -> Result<Vec<Vec<u8>>> {
    (0..total_parties)
        .map(|party| {
            let x = party as u64 + 1;
            let point = all_commitments
                .iter()
                .try_fold(ProjectivePoint::IDENTITY, |acc, commitments| {
                    Ok::<_, Error>(acc + evaluate_commitments(commitments, x)?)
                })?;
            Ok(encode_point(&point))
        })
        .collect()
}

/// Signer x-coordinates (`index + 1`) must be pairwise distinct
fn check_distinct(signers: &[PartyIndex]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for &signer in signers {
        if !seen.insert(signer) {
            return Err(Error::DuplicateXCoordinate(signer as u64 + 1));
        }
    }
    Ok(())
}

/// Lagrange coefficient at 0 for `party_index` within `signers`
fn compute_lagrange_coefficient(party_index: PartyIndex, signers: &[PartyIndex]) -> Result<Scalar> {
    check_distinct(signers)?;
    let i = Scalar::from(party_index as u64 + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &signer in signers {
        if signer == party_index {
            continue;
        }
        let j = Scalar::from(signer as u64 + 1);
        numerator *= j;
        denominator *= j - i;
    }

    let inverse = Option::<Scalar>::from(denominator.invert()).ok_or(Error::NonInvertible)?;
    Ok(numerator * inverse)
}

/// x-coordinate of R reduced mod n
fn r_scalar(r_point: &ProjectivePoint) -> Scalar {
    let encoded = r_point.to_affine().to_encoded_point(false);
    let x: [u8; 32] = encoded.as_bytes()[1..33].try_into().unwrap_or([0u8; 32]);
    <Scalar as Reduce<U256>>::reduce_bytes(&x.into())
}
