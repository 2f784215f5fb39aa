//! Session state machine
//!
//! `Session` owns no I/O. The actor feeds it one [`Event`] at a time and
//! delivers whatever [`Outbound`] messages come back, so every transition of a
//! session is linearized by construction.

use crate::curve::{address, decode_point, encode_point, scalar_from_biguint, sum_points};
use crate::messages::{
    CommitmentMessage, CommitmentPayload, ErrorMessage, FragmentPayload, GroupKeyMessage,
    PartialSignatureMessage, RegisterMessage, RegisteredMessage, SignRequestMessage,
    SignatureFragment, SignatureResultMessage, StartMessage,
};
use crate::sharing::Polynomial;
use crate::sign::{combine_reconstruction, message_hash};
use crate::tss::TssEngine;
use crate::{Error, PartyIndex, Result, Scheme, SessionConfig, Signature};
use k256::ProjectivePoint;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Forming,
    Committing,
    KeyReady,
    SigningReady,
    Signing,
    Complete,
    Failed,
}

impl Phase {
    /// Whether the session is waiting on parties (and so subject to the phase timeout)
    pub fn is_awaiting_parties(&self) -> bool {
        matches!(
            self,
            Phase::Forming | Phase::Committing | Phase::KeyReady | Phase::Signing
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Forming => "forming",
            Phase::Committing => "committing",
            Phase::KeyReady => "key_ready",
            Phase::SigningReady => "signing_ready",
            Phase::Signing => "signing",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug)]
pub enum Event {
    Register { from: PartyIndex, message: RegisterMessage },
    Commitment { from: PartyIndex, message: CommitmentMessage },
    Ready { from: PartyIndex },
    SignRequest {
        request_id: String,
        message: Vec<u8>,
        signers: Option<Vec<PartyIndex>>,
    },
    PartialSignature { from: PartyIndex, message: PartialSignatureMessage },
    /// The current phase exceeded its timeout
    Timeout,
}

/// Coordinator → party message
#[derive(Debug, Clone)]
pub enum WireMessage {
    Registered(RegisteredMessage),
    Start(StartMessage),
    GroupKey(GroupKeyMessage),
    SignRequest(SignRequestMessage),
    SignatureResult(SignatureResultMessage),
    Error(ErrorMessage),
}

impl WireMessage {
    /// Mailbox kind
    pub fn kind(&self) -> &'static str {
        use crate::messages::kind;
        match self {
            WireMessage::Registered(_) => kind::REGISTERED,
            WireMessage::Start(_) => kind::START,
            WireMessage::GroupKey(_) => kind::GROUP_KEY,
            WireMessage::SignRequest(_) => kind::SIGN_REQUEST,
            WireMessage::SignatureResult(_) => kind::SIGNATURE_RESULT,
            WireMessage::Error(_) => kind::ERROR,
        }
    }

    /// JSON body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            WireMessage::Registered(m) => serde_json::to_vec(m),
            WireMessage::Start(m) => serde_json::to_vec(m),
            WireMessage::GroupKey(m) => serde_json::to_vec(m),
            WireMessage::SignRequest(m) => serde_json::to_vec(m),
            WireMessage::SignatureResult(m) => serde_json::to_vec(m),
            WireMessage::Error(m) => serde_json::to_vec(m),
        };
        bytes.map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Output of the state machine
#[derive(Debug)]
pub enum Outbound {
    /// To one party
    Party { to: PartyIndex, message: WireMessage },
    /// To every party of the session
    Broadcast(WireMessage),
    /// Outcome of a locally requested signature
    SignOutcome { request_id: String, result: Result<Signature> },
}

struct SigningRound {
    request_id: String,
    hash: [u8; 32],
    signers: Vec<PartyIndex>,
    fragments: BTreeMap<PartyIndex, SignatureFragment>,
    declined: BTreeMap<PartyIndex, String>,
}

impl SigningRound {
    fn reported(&self) -> usize {
        self.fragments.len() + self.declined.len()
    }

    fn missing(&self) -> Vec<PartyIndex> {
        self.signers
            .iter()
            .copied()
            .filter(|p| !self.fragments.contains_key(p) && !self.declined.contains_key(p))
            .collect()
    }
}

/// One coordinated DKG / signing session
pub struct Session {
    config: SessionConfig,
    engine: Arc<dyn TssEngine>,
    phase: Phase,
    registered: BTreeSet<PartyIndex>,
    commitments: BTreeMap<PartyIndex, CommitmentPayload>,
    group_key: Option<Vec<u8>>,
    address: Option<String>,
    ready: BTreeSet<PartyIndex>,
    round: Option<SigningRound>,
    last_signature: Option<Signature>,
    /// Consecutive rounds rejected by verification
    rejected_rounds: usize,
    failure: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig, engine: Arc<dyn TssEngine>) -> Self {
        Self {
            config,
            engine,
            phase: Phase::Forming,
            registered: BTreeSet::new(),
            commitments: BTreeMap::new(),
            group_key: None,
            address: None,
            ready: BTreeSet::new(),
            round: None,
            last_signature: None,
            rejected_rounds: 0,
            failure: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn participants(&self) -> Vec<PartyIndex> {
        self.registered.iter().copied().collect()
    }

    /// Compressed group public key, once aggregated
    pub fn group_key(&self) -> Option<&[u8]> {
        self.group_key.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Why the session failed
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Advance the session by one event
    pub fn apply(&mut self, event: Event) -> Vec<Outbound> {
        if self.phase == Phase::Failed {
            return match event {
                Event::SignRequest { request_id, .. } => vec![self.reject(
                    request_id,
                    Error::Coordinator(format!(
                        "session failed: {}",
                        self.failure.as_deref().unwrap_or("unknown")
                    )),
                )],
                other => {
                    debug!(
                        session_id = %self.config.session_id,
                        event = ?other,
                        "Ignoring event for failed session"
                    );
                    Vec::new()
                }
            };
        }

        match event {
            Event::Register { from, message } => self.on_register(from, message),
            Event::Commitment { from, message } => self.on_commitment(from, message),
            Event::Ready { from } => self.on_ready(from),
            Event::SignRequest {
                request_id,
                message,
                signers,
            } => self.on_sign_request(request_id, message, signers),
            Event::PartialSignature { from, message } => self.on_partial_signature(from, message),
            Event::Timeout => self.on_timeout(),
        }
    }

    fn on_register(&mut self, from: PartyIndex, message: RegisterMessage) -> Vec<Outbound> {
        if self.phase != Phase::Forming {
            warn!(party_index = from, phase = %self.phase, "Registration after the session formed");
            return vec![self.party_error(from, &self.unexpected("register"))];
        }
        if message.party_index != from || self.config.check_party(from).is_err() {
            return vec![self.party_error(from, &Error::InvalidPartyIndex(message.party_index))];
        }

        let threshold_mismatch = message.threshold.is_some_and(|t| t != self.config.threshold);
        let parties_mismatch = message
            .total_parties
            .is_some_and(|n| n != self.config.total_parties);
        if threshold_mismatch || parties_mismatch {
            return self.fail(Error::InvalidConfig(format!(
                "party {} expects {}-of-{}, session is {}-of-{}",
                from,
                message.threshold.unwrap_or(self.config.threshold),
                message.total_parties.unwrap_or(self.config.total_parties),
                self.config.threshold,
                self.config.total_parties
            )));
        }

        if !self.registered.insert(from) {
            warn!(party_index = from, "Duplicate registration rejected");
            return vec![self.party_error(from, &Error::DuplicateParty(from))];
        }

        info!(
            session_id = %self.config.session_id,
            party_index = from,
            registered = self.registered.len(),
            total = self.config.total_parties,
            "Party registered"
        );

        let mut out = vec![Outbound::Party {
            to: from,
            message: WireMessage::Registered(RegisteredMessage {
                session_id: self.config.session_id.clone(),
                threshold: self.config.threshold,
                total_parties: self.config.total_parties,
                scheme: self.config.scheme,
            }),
        }];

        if self.registered.len() == self.config.total_parties {
            self.phase = Phase::Committing;
            info!(session_id = %self.config.session_id, "Quorum reached, starting key generation");
            out.push(Outbound::Broadcast(WireMessage::Start(StartMessage {
                session_seed: self.config.session_seed.clone(),
            })));
        }
        out
    }

    fn on_commitment(&mut self, from: PartyIndex, message: CommitmentMessage) -> Vec<Outbound> {
        if self.phase != Phase::Committing {
            debug!(
                party_index = from,
                phase = %self.phase,
                "Ignoring commitment outside committing phase"
            );
            return Vec::new();
        }
        if message.party_index != from || !self.registered.contains(&from) {
            return vec![self.party_error(from, &Error::InvalidPartyIndex(message.party_index))];
        }
        if self.commitments.contains_key(&from) {
            warn!(party_index = from, "Duplicate commitment ignored");
            return Vec::new();
        }

        if let Err(e) = self.check_commitment(&message.payload) {
            return self.fail(Error::VerificationFailed(format!(
                "commitment from party {}: {}",
                from, e
            )));
        }
        self.commitments.insert(from, message.payload);
        debug!(party_index = from, received = self.commitments.len(), "Commitment received");

        if self.commitments.len() < self.config.total_parties {
            return Vec::new();
        }

        match self.aggregate() {
            Ok(group_key) => {
                self.phase = Phase::KeyReady;
                vec![Outbound::Broadcast(WireMessage::GroupKey(group_key))]
            }
            Err(e) => self.fail(e),
        }
    }

    fn check_commitment(&self, payload: &CommitmentPayload) -> Result<()> {
        match (self.config.scheme, payload) {
            (Scheme::Threshold, CommitmentPayload::PublicKey { point }) => {
                decode_point(point).map(|_| ())
            }
            (Scheme::Reconstruction, CommitmentPayload::Polynomial { polynomial }) => {
                if polynomial.len() != self.config.threshold {
                    return Err(Error::InvalidConfig(format!(
                        "polynomial has {} coefficients, expected {}",
                        polynomial.len(),
                        self.config.threshold
                    )));
                }
                Ok(())
            }
            (scheme, _) => Err(Error::InvalidConfig(format!(
                "commitment does not match the {} scheme",
                scheme
            ))),
        }
    }

    /// Sum every party's commitment into the group key
    fn aggregate(&mut self) -> Result<GroupKeyMessage> {
        if self.commitments.len() != self.config.total_parties {
            return Err(Error::InsufficientParticipants {
                required: self.config.total_parties,
                actual: self.commitments.len(),
            });
        }

        let mut points = Vec::with_capacity(self.commitments.len());
        let mut polynomials: Vec<Polynomial> = Vec::new();
        for payload in self.commitments.values() {
            match payload {
                CommitmentPayload::PublicKey { point } => points.push(point.clone()),
                CommitmentPayload::Polynomial { polynomial } => {
                    let constant = polynomial
                        .constant_term()
                        .ok_or_else(|| Error::InvalidConfig("empty polynomial".into()))?;
                    let point = ProjectivePoint::GENERATOR * scalar_from_biguint(constant)?;
                    points.push(encode_point(&point));
                    polynomials.push(polynomial.clone());
                }
            }
        }

        let group_point = sum_points(points.iter().map(Vec::as_slice))?;
        if group_point == ProjectivePoint::IDENTITY {
            return Err(Error::Crypto("group key is the identity point".into()));
        }

        let group_key = encode_point(&group_point);
        let group_address = address(&group_point);
        info!(
            session_id = %self.config.session_id,
            group_key = hex::encode(&group_key),
            address = %group_address,
            "Group key aggregated"
        );

        self.group_key = Some(group_key.clone());
        self.address = Some(group_address.clone());

        Ok(GroupKeyMessage {
            group_public_key: group_key,
            address: group_address,
            participants: self.participants(),
            threshold: self.config.threshold,
            total_parties: self.config.total_parties,
            scheme: self.config.scheme,
            polynomials: match self.config.scheme {
                Scheme::Reconstruction => Some(polynomials),
                Scheme::Threshold => None,
            },
        })
    }

    fn on_ready(&mut self, from: PartyIndex) -> Vec<Outbound> {
        if self.phase != Phase::KeyReady {
            debug!(
                party_index = from,
                phase = %self.phase,
                "Ignoring ready outside key_ready phase"
            );
            return Vec::new();
        }
        if !self.registered.contains(&from) {
            return vec![self.party_error(from, &Error::InvalidPartyIndex(from))];
        }
        self.ready.insert(from);
        if self.ready.len() == self.config.total_parties {
            self.phase = Phase::SigningReady;
            info!(session_id = %self.config.session_id, "All parties ready to sign");
        }
        Vec::new()
    }

    fn on_sign_request(
        &mut self,
        request_id: String,
        message: Vec<u8>,
        signers: Option<Vec<PartyIndex>>,
    ) -> Vec<Outbound> {
        if !matches!(self.phase, Phase::SigningReady | Phase::Complete) {
            return vec![self.reject(request_id, self.unexpected("sign_request"))];
        }

        let signers = match self.select_signers(signers) {
            Ok(signers) => signers,
            Err(e) => return vec![self.reject(request_id, e)],
        };

        info!(
            session_id = %self.config.session_id,
            request_id = %request_id,
            signers = ?signers,
            "Signing round started"
        );

        self.round = Some(SigningRound {
            request_id: request_id.clone(),
            hash: message_hash(&message),
            signers: signers.clone(),
            fragments: BTreeMap::new(),
            declined: BTreeMap::new(),
        });
        self.phase = Phase::Signing;

        vec![Outbound::Broadcast(WireMessage::SignRequest(SignRequestMessage {
            request_id,
            message,
            signers,
        }))]
    }

    /// Requested signers, or the lowest `K` ready parties
    fn select_signers(&self, requested: Option<Vec<PartyIndex>>) -> Result<Vec<PartyIndex>> {
        let Some(mut signers) = requested else {
            return Ok(self.ready.iter().copied().take(self.config.threshold).collect());
        };

        signers.sort_unstable();
        let before = signers.len();
        signers.dedup();
        if signers.len() != before {
            return Err(Error::InvalidConfig("duplicate signer".into()));
        }
        if let Some(&unknown) = signers.iter().find(|p| !self.ready.contains(p)) {
            return Err(Error::InvalidPartyIndex(unknown));
        }
        if signers.len() < self.config.threshold {
            return Err(Error::InsufficientParticipants {
                required: self.config.threshold,
                actual: signers.len(),
            });
        }
        Ok(signers)
    }

    fn on_partial_signature(
        &mut self,
        from: PartyIndex,
        message: PartialSignatureMessage,
    ) -> Vec<Outbound> {
        if self.phase != Phase::Signing {
            debug!(
                party_index = from,
                phase = %self.phase,
                "Ignoring fragment outside a signing round"
            );
            return Vec::new();
        }
        let Some(round) = self.round.as_mut() else {
            debug!(
                party_index = from,
                request_id = %message.request_id,
                "Ignoring fragment without an open round"
            );
            return Vec::new();
        };
        if message.request_id != round.request_id || !round.signers.contains(&from) {
            debug!(
                party_index = from,
                request_id = %message.request_id,
                "Ignoring fragment for another round"
            );
            return Vec::new();
        }
        if round.fragments.contains_key(&from) || round.declined.contains_key(&from) {
            warn!(party_index = from, "Duplicate fragment ignored");
            return Vec::new();
        }

        match (message.fragment, message.error) {
            (Some(fragment), _)
                if fragment.party_index == from && fragment.request_id == round.request_id =>
            {
                round.fragments.insert(from, fragment);
            }
            (_, Some(error)) => {
                warn!(party_index = from, error = %error, "Party declined to sign");
                round.declined.insert(from, error);
            }
            _ => {
                round.declined.insert(from, "malformed fragment".into());
            }
        }

        if round.reported() < round.signers.len() {
            return Vec::new();
        }
        self.finish_round()
    }

    fn finish_round(&mut self) -> Vec<Outbound> {
        let Some(round) = self.round.take() else {
            return Vec::new();
        };

        if round.fragments.len() < self.config.threshold {
            let error = Error::InsufficientParticipants {
                required: self.config.threshold,
                actual: round.fragments.len(),
            };
            let reported = Err(Error::Coordinator(error.to_string()));
            let mut out = self.round_result(&round.request_id, reported);
            out.extend(self.fail(error));
            return out;
        }

        let fragments: Vec<SignatureFragment> = round.fragments.into_values().collect();
        let combined = self.combine(&fragments, &round.hash);

        match combined {
            Ok(signature) => {
                info!(
                    session_id = %self.config.session_id,
                    request_id = %round.request_id,
                    r = hex::encode(signature.r),
                    "Signature combined and verified"
                );
                self.phase = Phase::Complete;
                self.rejected_rounds = 0;
                self.last_signature = Some(signature.clone());
                self.round_result(&round.request_id, Ok(signature))
            }
            Err(Error::NonInvertible) => {
                let mut out = self.round_result(&round.request_id, Err(Error::NonInvertible));
                out.extend(self.fail(Error::NonInvertible));
                out
            }
            Err(e) => {
                self.rejected_rounds += 1;
                warn!(
                    request_id = %round.request_id,
                    error = %e,
                    rejected_rounds = self.rejected_rounds,
                    "Signing round rejected"
                );
                let exhausted = self.rejected_rounds > self.config.max_signing_retries;
                let message = e.to_string();
                let mut out = self.round_result(&round.request_id, Err(e));
                if exhausted {
                    out.extend(self.fail(Error::VerificationFailed(format!(
                        "{} consecutive signing rounds rejected, last: {}",
                        self.rejected_rounds, message
                    ))));
                } else {
                    self.phase = Phase::SigningReady;
                }
                out
            }
        }
    }

    fn combine(&self, fragments: &[SignatureFragment], hash: &[u8; 32]) -> Result<Signature> {
        let group_key = self
            .group_key
            .as_deref()
            .ok_or_else(|| Error::Internal("signing without a group key".into()))?;

        match self.config.scheme {
            Scheme::Reconstruction => {
                let shares = fragments
                    .iter()
                    .map(|fragment| match &fragment.payload {
                        FragmentPayload::Share { share } => Ok(share.clone()),
                        FragmentPayload::Engine { .. } => Err(Error::VerificationFailed(format!(
                            "party {} sent an engine fragment",
                            fragment.party_index
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                combine_reconstruction(group_key, &shares, self.config.threshold, hash)
            }
            Scheme::Threshold => self.engine.combine(group_key, fragments, hash),
        }
    }

    fn round_result(&self, request_id: &str, result: Result<Signature>) -> Vec<Outbound> {
        let message = match &result {
            Ok(signature) => SignatureResultMessage {
                request_id: request_id.to_string(),
                ok: true,
                signature: Some(signature.clone()),
                error: None,
            },
            Err(e) => SignatureResultMessage {
                request_id: request_id.to_string(),
                ok: false,
                signature: None,
                error: Some(e.to_string()),
            },
        };
        vec![
            Outbound::Broadcast(WireMessage::SignatureResult(message)),
            Outbound::SignOutcome {
                request_id: request_id.to_string(),
                result,
            },
        ]
    }

    fn on_timeout(&mut self) -> Vec<Outbound> {
        if !self.phase.is_awaiting_parties() {
            return Vec::new();
        }

        let all: BTreeSet<PartyIndex> = self.config.parties().collect();
        let missing: Vec<PartyIndex> = match self.phase {
            Phase::Forming => all.difference(&self.registered).copied().collect(),
            Phase::Committing => all
                .iter()
                .copied()
                .filter(|p| !self.commitments.contains_key(p))
                .collect(),
            Phase::KeyReady => all.difference(&self.ready).copied().collect(),
            Phase::Signing => self.round.as_ref().map(SigningRound::missing).unwrap_or_default(),
            _ => Vec::new(),
        };
        let error = Error::PartyTimeout(format!(
            "phase {}, missing parties {:?}",
            self.phase, missing
        ));

        let mut out = Vec::new();
        if let Some(round) = self.round.take() {
            let error = Error::PartyTimeout(format!("fragments from {:?}", missing));
            out.extend(self.round_result(&round.request_id, Err(error)));
        }
        out.extend(self.fail(error));
        out
    }

    /// Move to `Failed` and tell every party
    fn fail(&mut self, error: Error) -> Vec<Outbound> {
        warn!(
            session_id = %self.config.session_id,
            phase = %self.phase,
            error = %error,
            "Session failed"
        );
        self.phase = Phase::Failed;
        self.failure = Some(error.to_string());
        vec![Outbound::Broadcast(WireMessage::Error(ErrorMessage {
            message: error.to_string(),
            fatal: true,
        }))]
    }

    fn party_error(&self, to: PartyIndex, error: &Error) -> Outbound {
        Outbound::Party {
            to,
            message: WireMessage::Error(ErrorMessage {
                message: error.to_string(),
                fatal: false,
            }),
        }
    }

    fn reject(&self, request_id: String, error: Error) -> Outbound {
        warn!(request_id = %request_id, error = %error, "Signing request rejected");
        Outbound::SignOutcome {
            request_id,
            result: Err(error),
        }
    }

    fn unexpected(&self, kind: &str) -> Error {
        Error::UnexpectedMessage {
            kind: kind.to_string(),
            phase: self.phase.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::PrimeField;
    use crate::sign::verify_signature;
    use crate::tss::{Presignature, RelayTssEngine};
    use crate::KeyShare;
    use k256::{elliptic_curve::Field, Scalar};
    use rand::rngs::OsRng;

    fn session(scheme: Scheme) -> Session {
        let config = SessionConfig::new(3, 2, scheme)
            .unwrap()
            .with_session_id("test-session");
        Session::new(config, Arc::new(RelayTssEngine::new()))
    }

    fn register(session: &mut Session, party: PartyIndex) -> Vec<Outbound> {
        session.apply(Event::Register {
            from: party,
            message: RegisterMessage {
                party_index: party,
                threshold: Some(2),
                total_parties: Some(3),
            },
        })
    }

    fn has_broadcast(out: &[Outbound], kind: &str) -> bool {
        out.iter()
            .any(|o| matches!(o, Outbound::Broadcast(m) if m.kind() == kind))
    }

    fn commit_points(session: &mut Session, parties: &[PartyIndex]) -> Vec<Outbound> {
        let mut out = Vec::new();
        for &party in parties {
            let point = ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
            out = session.apply(Event::Commitment {
                from: party,
                message: CommitmentMessage {
                    party_index: party,
                    payload: CommitmentPayload::PublicKey {
                        point: encode_point(&point),
                    },
                },
            });
        }
        out
    }

    /// Drive a reconstruction session to `SigningReady`; returns every party's share
    fn reconstruction_ready(session: &mut Session) -> Vec<crate::sharing::Share> {
        let field = PrimeField::secp256k1();
        for party in 0..3 {
            register(session, party);
        }
        let polys: Vec<Polynomial> = (0..3)
            .map(|_| field.generate_polynomial(2, &mut OsRng).unwrap())
            .collect();
        for (party, poly) in polys.iter().enumerate() {
            session.apply(Event::Commitment {
                from: party,
                message: CommitmentMessage {
                    party_index: party,
                    payload: CommitmentPayload::Polynomial {
                        polynomial: poly.clone(),
                    },
                },
            });
        }
        for party in 0..3 {
            session.apply(Event::Ready { from: party });
        }
        assert_eq!(session.phase(), Phase::SigningReady);

        let combined = field.sum_polynomials(&polys).unwrap();
        (0..3).map(|p| field.share_for(&combined, p)).collect()
    }

    fn share_fragment(request_id: &str, share: &crate::sharing::Share, party: PartyIndex) -> Event {
        Event::PartialSignature {
            from: party,
            message: PartialSignatureMessage {
                party_index: party,
                request_id: request_id.to_string(),
                fragment: Some(SignatureFragment {
                    party_index: party,
                    request_id: request_id.to_string(),
                    payload: FragmentPayload::Share { share: share.clone() },
                }),
                error: None,
            },
        }
    }

    fn sign_request(
        session: &mut Session,
        request_id: &str,
        signers: Option<Vec<PartyIndex>>,
    ) -> Vec<Outbound> {
        session.apply(Event::SignRequest {
            request_id: request_id.to_string(),
            message: b"hello".to_vec(),
            signers,
        })
    }

    #[test]
    fn test_start_broadcast_only_at_quorum() {
        let mut s = session(Scheme::Threshold);
        assert!(!has_broadcast(&register(&mut s, 0), "start"));
        assert!(!has_broadcast(&register(&mut s, 2), "start"));
        assert_eq!(s.phase(), Phase::Forming);

        let out = register(&mut s, 1);
        assert!(has_broadcast(&out, "start"));
        assert_eq!(s.phase(), Phase::Committing);
        assert_eq!(s.participants(), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_registration_is_recoverable() {
        let mut s = session(Scheme::Threshold);
        register(&mut s, 0);
        let out = register(&mut s, 0);

        assert!(matches!(
            &out[..],
            [Outbound::Party {
                to: 0,
                message: WireMessage::Error(ErrorMessage { fatal: false, .. })
            }]
        ));
        assert_eq!(s.phase(), Phase::Forming);
        assert_eq!(s.participants(), vec![0]);
    }

    #[test]
    fn test_config_mismatch_fails_session() {
        let mut s = session(Scheme::Threshold);
        let out = s.apply(Event::Register {
            from: 1,
            message: RegisterMessage {
                party_index: 1,
                threshold: Some(3),
                total_parties: Some(3),
            },
        });
        assert!(has_broadcast(&out, "error"));
        assert_eq!(s.phase(), Phase::Failed);
    }

    #[test]
    fn test_out_of_range_party_rejected() {
        let mut s = session(Scheme::Threshold);
        let out = register(&mut s, 3);
        assert!(matches!(&out[..], [Outbound::Party { to: 3, .. }]));
        assert!(s.participants().is_empty());
    }

    #[test]
    fn test_no_group_key_before_all_commitments() {
        let mut s = session(Scheme::Threshold);
        for party in 0..3 {
            register(&mut s, party);
        }

        let out = commit_points(&mut s, &[0, 1]);
        assert!(out.is_empty());
        assert_eq!(s.phase(), Phase::Committing);
        assert!(s.group_key().is_none());

        // a repeated commitment does not count towards quorum
        assert!(commit_points(&mut s, &[1]).is_empty());
        assert_eq!(s.phase(), Phase::Committing);

        let out = commit_points(&mut s, &[2]);
        assert!(has_broadcast(&out, "group_key"));
        assert_eq!(s.phase(), Phase::KeyReady);
        assert!(s.address().unwrap().starts_with("0x"));
    }

    #[test]
    fn test_wrong_commitment_kind_fails_session() {
        let mut s = session(Scheme::Reconstruction);
        for party in 0..3 {
            register(&mut s, party);
        }
        commit_points(&mut s, &[0]);
        assert_eq!(s.phase(), Phase::Failed);
        assert!(s.failure().is_some());
    }

    #[test]
    fn test_group_key_is_sum_of_constant_terms() {
        let mut s = session(Scheme::Reconstruction);
        let shares = reconstruction_ready(&mut s);

        let field = PrimeField::secp256k1();
        let secret = field.reconstruct_secret(&shares[..2], 2).unwrap();
        let expected = ProjectivePoint::GENERATOR * scalar_from_biguint(&secret).unwrap();
        assert_eq!(s.group_key().unwrap(), encode_point(&expected).as_slice());
    }

    #[test]
    fn test_sign_rejected_before_signing_ready() {
        let mut s = session(Scheme::Threshold);
        let out = sign_request(&mut s, "r1", None);
        assert!(matches!(
            &out[..],
            [Outbound::SignOutcome { result: Err(Error::UnexpectedMessage { .. }), .. }]
        ));
        assert_eq!(s.phase(), Phase::Forming);
    }

    #[test]
    fn test_no_combination_below_threshold() {
        let mut s = session(Scheme::Reconstruction);
        let shares = reconstruction_ready(&mut s);

        let out = sign_request(&mut s, "r1", Some(vec![0]));
        assert!(matches!(
            &out[..],
            [Outbound::SignOutcome {
                result: Err(Error::InsufficientParticipants { required: 2, actual: 1 }),
                ..
            }]
        ));

        sign_request(&mut s, "r1", None);
        assert_eq!(s.phase(), Phase::Signing);
        let out = s.apply(share_fragment("r1", &shares[0], 0));
        assert!(out.is_empty());
        assert_eq!(s.phase(), Phase::Signing);
    }

    #[test]
    fn test_reconstruction_signature_round() {
        let mut s = session(Scheme::Reconstruction);
        let shares = reconstruction_ready(&mut s);

        let out = sign_request(&mut s, "r1", Some(vec![0, 2]));
        assert!(has_broadcast(&out, "sign_request"));

        // non-signer fragments are not counted
        assert!(s.apply(share_fragment("r1", &shares[1], 1)).is_empty());
        s.apply(share_fragment("r1", &shares[0], 0));
        let out = s.apply(share_fragment("r1", &shares[2], 2));

        let signature = out
            .iter()
            .find_map(|o| match o {
                Outbound::SignOutcome { result: Ok(sig), .. } => Some(sig.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(s.phase(), Phase::Complete);
        verify_signature(s.group_key().unwrap(), &message_hash(b"hello"), &signature).unwrap();

        // Complete accepts another request
        assert!(has_broadcast(&sign_request(&mut s, "r2", None), "sign_request"));
    }

    #[test]
    fn test_verification_failure_returns_to_signing_ready() {
        let mut s = session(Scheme::Reconstruction);
        let mut shares = reconstruction_ready(&mut s);
        shares[1].y += 1u32;

        sign_request(&mut s, "r1", None);
        s.apply(share_fragment("r1", &shares[0], 0));
        let out = s.apply(share_fragment("r1", &shares[1], 1));

        assert!(has_failed_result(&out));
        assert_eq!(s.phase(), Phase::SigningReady);
    }

    fn has_failed_result(out: &[Outbound]) -> bool {
        out.iter().any(|o| {
            matches!(
                o,
                Outbound::Broadcast(WireMessage::SignatureResult(SignatureResultMessage {
                    ok: false,
                    ..
                }))
            )
        })
    }

    #[test]
    fn test_rejected_rounds_exhaust_retries() {
        let config = SessionConfig::new(3, 2, Scheme::Reconstruction)
            .unwrap()
            .with_session_id("test-session")
            .with_max_signing_retries(2);
        let mut s = Session::new(config, Arc::new(RelayTssEngine::new()));
        let mut shares = reconstruction_ready(&mut s);
        shares[1].y += 1u32;

        for attempt in 0..3 {
            let request_id = format!("r{}", attempt);
            sign_request(&mut s, &request_id, None);
            s.apply(share_fragment(&request_id, &shares[0], 0));
            let out = s.apply(share_fragment(&request_id, &shares[1], 1));
            assert!(has_failed_result(&out));

            if attempt < 2 {
                assert_eq!(s.phase(), Phase::SigningReady);
                assert!(!has_broadcast(&out, "error"));
            } else {
                assert!(has_broadcast(&out, "error"));
            }
        }

        assert_eq!(s.phase(), Phase::Failed);
        assert!(s.failure().unwrap().contains("3 consecutive"));
        assert!(matches!(
            &sign_request(&mut s, "r3", None)[..],
            [Outbound::SignOutcome { result: Err(Error::Coordinator(_)), .. }]
        ));
    }

    #[test]
    fn test_successful_round_resets_retries() {
        let config = SessionConfig::new(3, 2, Scheme::Reconstruction)
            .unwrap()
            .with_session_id("test-session")
            .with_max_signing_retries(1);
        let mut s = Session::new(config, Arc::new(RelayTssEngine::new()));
        let shares = reconstruction_ready(&mut s);
        let mut bad = shares.clone();
        bad[1].y += 1u32;

        let plan = [
            (&bad, Phase::SigningReady),
            (&shares, Phase::Complete),
            (&bad, Phase::SigningReady),
        ];
        for (attempt, (round_shares, phase)) in plan.into_iter().enumerate() {
            let request_id = format!("r{}", attempt);
            sign_request(&mut s, &request_id, None);
            s.apply(share_fragment(&request_id, &round_shares[0], 0));
            s.apply(share_fragment(&request_id, &round_shares[1], 1));
            assert_eq!(s.phase(), phase);
        }
    }

    /// Drive a threshold session to `SigningReady` with random public shares
    fn threshold_ready(session: &mut Session) {
        for party in 0..3 {
            register(session, party);
        }
        commit_points(session, &[0, 1, 2]);
        for party in 0..3 {
            session.apply(Event::Ready { from: party });
        }
        assert_eq!(session.phase(), Phase::SigningReady);
    }

    fn engine_fragment(request_id: &str, party: PartyIndex) -> Event {
        let point = ProjectivePoint::GENERATOR * Scalar::random(&mut OsRng);
        let key = KeyShare {
            session_id: "test-session".into(),
            party_index: party,
            total_parties: 3,
            threshold: 2,
            scheme: Scheme::Threshold,
            secret_share: Scalar::random(&mut OsRng),
            group_key: encode_point(&point),
            address: address(&point),
            public_shares: Vec::new(),
        };
        let presignature = Presignature {
            request_id: request_id.to_string(),
            signers: vec![0, 1],
            r_point: encode_point(&(ProjectivePoint::GENERATOR * Scalar::from(7u64))),
            k_share: Scalar::random(&mut OsRng),
            sigma_share: Scalar::random(&mut OsRng),
        };
        let data = RelayTssEngine::new()
            .partial_sign(&key, &presignature, &message_hash(b"hello"))
            .unwrap();
        Event::PartialSignature {
            from: party,
            message: PartialSignatureMessage {
                party_index: party,
                request_id: request_id.to_string(),
                fragment: Some(SignatureFragment {
                    party_index: party,
                    request_id: request_id.to_string(),
                    payload: FragmentPayload::Engine { data },
                }),
                error: None,
            },
        }
    }

    #[test]
    fn test_threshold_verification_failure_returns_to_signing_ready() {
        let mut s = session(Scheme::Threshold);
        threshold_ready(&mut s);

        sign_request(&mut s, "r1", None);
        s.apply(engine_fragment("r1", 0));
        let out = s.apply(engine_fragment("r1", 1));

        assert!(has_failed_result(&out));
        assert!(out.iter().any(|o| matches!(
            o,
            Outbound::SignOutcome { result: Err(Error::VerificationFailed(_)), .. }
        )));
        assert_eq!(s.phase(), Phase::SigningReady);
        assert!(s.last_signature().is_none());
    }

    #[test]
    fn test_threshold_rejects_share_fragment() {
        let mut s = session(Scheme::Threshold);
        threshold_ready(&mut s);
        let share = crate::sharing::Share::new(2, num_bigint::BigUint::from(11u32));

        sign_request(&mut s, "r1", None);
        s.apply(engine_fragment("r1", 0));
        let out = s.apply(share_fragment("r1", &share, 1));

        assert!(has_failed_result(&out));
        assert_eq!(s.phase(), Phase::SigningReady);
    }

    #[test]
    fn test_declined_signer_below_threshold_fails() {
        let mut s = session(Scheme::Reconstruction);
        let shares = reconstruction_ready(&mut s);

        sign_request(&mut s, "r1", None);
        s.apply(share_fragment("r1", &shares[0], 0));
        s.apply(Event::PartialSignature {
            from: 1,
            message: PartialSignatureMessage {
                party_index: 1,
                request_id: "r1".into(),
                fragment: None,
                error: Some("no key share".into()),
            },
        });
        assert_eq!(s.phase(), Phase::Failed);
    }

    #[test]
    fn test_late_fragment_ignored() {
        let mut s = session(Scheme::Reconstruction);
        let shares = reconstruction_ready(&mut s);

        sign_request(&mut s, "r1", None);
        s.apply(share_fragment("r1", &shares[0], 0));
        s.apply(share_fragment("r1", &shares[1], 1));
        assert_eq!(s.phase(), Phase::Complete);

        assert!(s.apply(share_fragment("r1", &shares[2], 2)).is_empty());
        assert_eq!(s.phase(), Phase::Complete);
    }

    #[test]
    fn test_timeout_fails_waiting_phase() {
        let mut s = session(Scheme::Threshold);
        register(&mut s, 0);
        let out = s.apply(Event::Timeout);

        assert!(has_broadcast(&out, "error"));
        assert_eq!(s.phase(), Phase::Failed);
        assert!(s.failure().unwrap().contains("[1, 2]"));
    }

    #[test]
    fn test_timeout_ignored_when_idle() {
        let mut s = session(Scheme::Reconstruction);
        reconstruction_ready(&mut s);
        assert!(s.apply(Event::Timeout).is_empty());
        assert_eq!(s.phase(), Phase::SigningReady);
    }
}
