//! Core types shared by the coordinator and the parties

use crate::{Error, Result};
use k256::{ecdsa, ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Index of a party within a session, in `[0, N)`
pub type PartyIndex = usize;

/// Opaque session identifier
pub type SessionId = String;

/// Default per-phase timeout
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of signing retries after a round fails verification
pub const DEFAULT_MAX_SIGNING_RETRIES: usize = 3;

/// Key generation / signing scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Parties exchange whole polynomials; any `K` shares reconstruct the
    /// joint secret. Custody by reconstruction, not threshold signing.
    Reconstruction,
    /// Parties publish only `share·G`; signing runs through a TSS engine.
    Threshold,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Reconstruction => write!(f, "reconstruction"),
            Scheme::Threshold => write!(f, "threshold"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconstruction" => Ok(Scheme::Reconstruction),
            "threshold" => Ok(Scheme::Threshold),
            other => Err(Error::InvalidConfig(format!("unknown scheme: {}", other))),
        }
    }
}

/// ECDSA signature (r, s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// R component
    pub r: [u8; 32],
    /// S component
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub recovery_id: u8,
}

impl Signature {
    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> Self {
        Self { r, s, recovery_id }
    }

    /// Build from a k256 signature and recovery id
    pub fn from_ecdsa(signature: &ecdsa::Signature, recovery_id: u8) -> Self {
        let (r, s) = signature.split_bytes();
        Self {
            r: r.into(),
            s: s.into(),
            recovery_id,
        }
    }

    /// The k256 form, for verification
    pub fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        ecdsa::Signature::from_scalars(
            *k256::FieldBytes::from_slice(&self.r),
            *k256::FieldBytes::from_slice(&self.s),
        )
        .map_err(|e| Error::Crypto(e.to_string()))
    }

    /// Convert to DER format
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_ecdsa()?.to_der().as_bytes().to_vec())
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }
}

/// Session parameters shared by the coordinator and every party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identifier
    pub session_id: SessionId,

    /// Threshold (K-of-N)
    pub threshold: usize,

    /// Number of parties (N)
    pub total_parties: usize,

    /// Key generation / signing scheme
    pub scheme: Scheme,

    /// Bound on every suspension point of the session
    pub phase_timeout: Duration,

    /// Session-wide nonce carried by the `start` broadcast
    pub session_seed: Option<String>,

    /// Consecutive rounds that may fail verification before the session fails
    #[serde(default = "default_max_signing_retries")]
    pub max_signing_retries: usize,
}

fn default_max_signing_retries() -> usize {
    DEFAULT_MAX_SIGNING_RETRIES
}

impl SessionConfig {
    /// Create a new session configuration with a time-derived session id
    pub fn new(total_parties: usize, threshold: usize, scheme: Scheme) -> Result<Self> {
        let config = Self {
            session_id: Self::default_session_id(),
            threshold,
            total_parties,
            scheme,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            session_seed: None,
            max_signing_retries: DEFAULT_MAX_SIGNING_RETRIES,
        };
        config.validate()?;
        Ok(config)
    }

    /// `session-<unix millis>`
    pub fn default_session_id() -> SessionId {
        format!("session-{}", chrono::Utc::now().timestamp_millis())
    }

    pub fn with_session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_phase_timeout(mut self, phase_timeout: Duration) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    pub fn with_max_signing_retries(mut self, retries: usize) -> Self {
        self.max_signing_retries = retries;
        self
    }

    pub fn with_session_seed(mut self, seed: impl Into<String>) -> Self {
        self.session_seed = Some(seed.into());
        self
    }

    /// Check `2 <= K <= N` and a non-empty session id
    pub fn validate(&self) -> Result<()> {
        if self.threshold > self.total_parties {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of parties".into(),
            ));
        }
        if self.threshold < 2 {
            return Err(Error::InvalidConfig(
                "Threshold must be at least 2".into(),
            ));
        }
        if self.session_id.is_empty() {
            return Err(Error::InvalidConfig("Session id must not be empty".into()));
        }
        Ok(())
    }

    /// Every party index of the session
    pub fn parties(&self) -> impl Iterator<Item = PartyIndex> {
        0..self.total_parties
    }

    pub fn check_party(&self, party_index: PartyIndex) -> Result<()> {
        if party_index >= self.total_parties {
            return Err(Error::InvalidPartyIndex(party_index));
        }
        Ok(())
    }
}

/// Share record held by a party after key generation
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// Session that produced the key
    pub session_id: SessionId,

    /// This party's index
    pub party_index: PartyIndex,

    /// Total number of parties
    pub total_parties: usize,

    /// Threshold
    pub threshold: usize,

    /// Scheme the key was generated under
    #[zeroize(skip)]
    pub scheme: Scheme,

    /// This party's Shamir share of the joint secret
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    pub secret_share: Scalar,

    /// Group public key (compressed SEC1)
    #[zeroize(skip)]
    pub group_key: Vec<u8>,

    /// Address derived from the group key
    pub address: String,

    /// `share_j·G` for every party j (compressed SEC1)
    #[zeroize(skip)]
    pub public_shares: Vec<Vec<u8>>,
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("session_id", &self.session_id)
            .field("party_index", &self.party_index)
            .field("total_parties", &self.total_parties)
            .field("threshold", &self.threshold)
            .field("scheme", &self.scheme)
            .field("group_key", &hex::encode(&self.group_key))
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl KeyShare {
    /// Get the group key as a ProjectivePoint
    pub fn group_key_point(&self) -> Result<ProjectivePoint> {
        crate::curve::decode_point(&self.group_key)
    }

    /// Check that this party's share matches its published public share
    pub fn verify_public_share(&self) -> Result<()> {
        let expected = self
            .public_shares
            .get(self.party_index)
            .ok_or(Error::InvalidPartyIndex(self.party_index))?;
        let actual = crate::curve::encode_point(&(ProjectivePoint::GENERATOR * self.secret_share));
        if &actual != expected {
            return Err(Error::VerificationFailed(format!(
                "share of party {} does not match its public share",
                self.party_index
            )));
        }
        Ok(())
    }
}

pub(crate) mod scalar_serde {
    use k256::{elliptic_curve::{bigint::U256, ops::Reduce}, Scalar};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(scalar.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid scalar length"))?;
        Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
    }
}
