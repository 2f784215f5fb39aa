//! Wire messages exchanged between the coordinator and the parties
//!
//! Every message travels as JSON over the rendezvous transport, in the
//! mailbox named by its kind.

use crate::sharing::{Polynomial, Share};
use crate::{PartyIndex, Scheme, SessionId, Signature};
use serde::{Deserialize, Serialize};

/// Mailbox kinds
pub mod kind {
    pub const REGISTER: &str = "register";
    pub const REGISTERED: &str = "registered";
    pub const START: &str = "start";
    pub const COMMITMENT: &str = "commitment";
    pub const GROUP_KEY: &str = "group_key";
    pub const READY: &str = "ready";
    pub const SIGN_REQUEST: &str = "sign_request";
    pub const PARTIAL_SIGNATURE: &str = "partial_signature";
    pub const SIGNATURE_RESULT: &str = "signature_result";
    pub const ERROR: &str = "error";
}

/// party → coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub party_index: PartyIndex,
    /// Threshold the party was configured with
    pub threshold: Option<usize>,
    /// Party count the party was configured with
    pub total_parties: Option<usize>,
}

/// coordinator → party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredMessage {
    pub session_id: SessionId,
    pub threshold: usize,
    pub total_parties: usize,
    pub scheme: Scheme,
}

/// coordinator → all
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartMessage {
    pub session_seed: Option<String>,
}

/// What a party commits to in the `Committing` phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitmentPayload {
    /// The whole polynomial, secret coefficient included (reconstruction scheme)
    Polynomial { polynomial: Polynomial },
    /// `share·G`, SEC1 encoded (threshold scheme)
    PublicKey { point: Vec<u8> },
}

/// party → coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentMessage {
    pub party_index: PartyIndex,
    pub payload: CommitmentPayload,
}

/// coordinator → all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyMessage {
    /// Compressed SEC1 group public key
    pub group_public_key: Vec<u8>,
    pub address: String,
    pub participants: Vec<PartyIndex>,
    pub threshold: usize,
    pub total_parties: usize,
    pub scheme: Scheme,
    /// Every party's polynomial, by party index (reconstruction scheme only)
    pub polynomials: Option<Vec<Polynomial>>,
}

/// party → coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub party_index: PartyIndex,
}

/// coordinator → all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequestMessage {
    pub request_id: String,
    pub message: Vec<u8>,
    /// Parties expected to produce a fragment
    pub signers: Vec<PartyIndex>,
}

/// Per-scheme fragment body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FragmentPayload {
    /// Raw share (reconstruction scheme)
    Share { share: Share },
    /// Opaque TSS engine output
    Engine { data: Vec<u8> },
}

/// One party's contribution to a signing round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFragment {
    pub party_index: PartyIndex,
    pub request_id: String,
    pub payload: FragmentPayload,
}

/// party → coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignatureMessage {
    pub party_index: PartyIndex,
    pub request_id: String,
    pub fragment: Option<SignatureFragment>,
    /// Why no fragment was produced
    pub error: Option<String>,
}

/// coordinator → all
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureResultMessage {
    pub request_id: String,
    pub ok: bool,
    pub signature: Option<Signature>,
    pub error: Option<String>,
}

/// coordinator → party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    /// The session has moved to `Failed`
    pub fatal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    #[test]
    fn test_commitment_payload_is_tagged() {
        let msg = CommitmentMessage {
            party_index: 1,
            payload: CommitmentPayload::PublicKey { point: vec![2, 3] },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "public_key");

        let poly = CommitmentPayload::Polynomial {
            polynomial: Polynomial::from_coefficients(vec![BigUint::from(3u32)]),
        };
        let json = serde_json::to_value(&poly).unwrap();
        assert_eq!(json["type"], "polynomial");
        assert_eq!(json["polynomial"]["coefficients"][0], "3");
    }

    #[test]
    fn test_fragment_round_trip() {
        let fragment = SignatureFragment {
            party_index: 2,
            request_id: "req".into(),
            payload: FragmentPayload::Share {
                share: Share::new(3, BigUint::from(59u32)),
            },
        };
        let bytes = serde_json::to_vec(&fragment).unwrap();
        let back: SignatureFragment = serde_json::from_slice(&bytes).unwrap();
        match back.payload {
            FragmentPayload::Share { share } => {
                assert_eq!(share, Share::new(3, BigUint::from(59u32)))
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
