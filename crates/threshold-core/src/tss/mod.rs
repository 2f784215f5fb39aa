//! Threshold-ECDSA engine interface
//!
//! Parties in the threshold scheme never exchange their session shares. Key
//! setup, nonce precomputation and partial signing are delegated to a
//! [`TssEngine`], which talks to its peers only through the rendezvous
//! [`Transport`]. The coordinator uses the same engine to combine fragments.

mod engine;

pub use engine::RelayTssEngine;

use crate::messages::SignatureFragment;
use crate::mpc::{read_json, send_json, Peer, Transport};
use crate::{Error, KeyShare, PartyIndex, Result, Signature};
use k256::Scalar;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Where an engine call runs: which session, which party, how to reach peers
pub struct EngineContext<'a> {
    pub transport: &'a dyn Transport,
    pub session_id: &'a str,
    pub party_index: PartyIndex,
    pub threshold: usize,
    pub total_parties: usize,
    /// Bound on every peer read
    pub timeout: Duration,
}

impl EngineContext<'_> {
    /// Send to another party
    pub async fn send<M: Serialize + Sync>(
        &self,
        to: PartyIndex,
        kind: &str,
        message: &M,
    ) -> Result<()> {
        send_json(
            self.transport,
            self.session_id,
            Peer::Party(self.party_index),
            Peer::Party(to),
            kind,
            message,
        )
        .await
    }

    /// Read from another party, bounded by the context timeout
    pub async fn recv<M: DeserializeOwned>(&self, from: PartyIndex, kind: &str) -> Result<M> {
        let read = read_json(
            self.transport,
            self.session_id,
            Peer::Party(from),
            Peer::Party(self.party_index),
            kind,
        );
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| Error::PartyTimeout(format!("{} from party {}", kind, from)))?
    }
}

/// Per-round state produced by `precompute`, consumed by `partial_sign`
#[derive(Clone)]
pub struct Presignature {
    pub request_id: String,
    pub signers: Vec<PartyIndex>,
    /// Nonce point R (compressed)
    pub r_point: Vec<u8>,
    /// This party's additive share of the nonce inverse
    pub k_share: Scalar,
    /// This party's additive share of `k·x`
    pub sigma_share: Scalar,
}

/// Black-box threshold-ECDSA primitive
#[async_trait::async_trait]
pub trait TssEngine: Send + Sync {
    /// Turn this party's session share into key material usable by any `K` signers.
    ///
    /// `group_key` is the coordinator's sum of every party's `share·G`.
    async fn setup(
        &self,
        ctx: &EngineContext<'_>,
        share: Scalar,
        group_key: &[u8],
    ) -> Result<KeyShare>;

    /// Message-independent signing round among `signers`
    async fn precompute(
        &self,
        ctx: &EngineContext<'_>,
        key: &KeyShare,
        request_id: &str,
        signers: &[PartyIndex],
    ) -> Result<Presignature>;

    /// This party's fragment for `hash`
    fn partial_sign(
        &self,
        key: &KeyShare,
        presignature: &Presignature,
        hash: &[u8; 32],
    ) -> Result<Vec<u8>>;

    /// Combine every signer's fragment and verify against `group_key`
    fn combine(
        &self,
        group_key: &[u8],
        fragments: &[SignatureFragment],
        hash: &[u8; 32],
    ) -> Result<Signature>;
}
