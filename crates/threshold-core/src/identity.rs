//! Long-lived party identity
//!
//! Each party keeps one persistent seed, independent of any session. Session
//! shares for the threshold scheme are derived from it and never leave the party.

use crate::{Error, PartyIndex, Result};
use hmac::{Hmac, Mac};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce},
    Scalar,
};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

const DERIVE_DOMAIN: &[u8] = b"threshold-core/session-share/v1";

/// Persistent per-party secret seed
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PersistentSeed {
    #[serde(with = "hex_seed")]
    seed: [u8; 32],
}

impl PersistentSeed {
    /// Fresh seed from the OS RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    pub fn from_bytes(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Session-scoped share: `HMAC-SHA256(seed, domain || session || index) mod n`
    pub fn derive(&self, session_id: &str, party_index: PartyIndex) -> Result<Scalar> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.seed)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        mac.update(DERIVE_DOMAIN);
        mac.update(&(session_id.len() as u64).to_be_bytes());
        mac.update(session_id.as_bytes());
        mac.update(&(party_index as u64).to_be_bytes());

        let digest = mac.finalize().into_bytes();
        let share = <Scalar as Reduce<U256>>::reduce_bytes(&digest);
        if bool::from(share.is_zero()) {
            return Err(Error::Crypto("derived a zero share".into()));
        }
        Ok(share)
    }

    /// Load the seed at `path`, creating and saving one if absent
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let seed = Self::generate();
        seed.save(path)?;
        info!(path = ?path, "Generated new party identity");
        Ok(seed)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

mod hex_seed {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(seed: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(seed))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("seed must be 32 bytes"))
    }
}
