//! Party (signer) side of the coordination protocol
//!
//! A party registers with the coordinator, contributes to key generation and
//! answers signing requests. Every wait is bounded by the party timeout, and
//! a fatal `error` broadcast from the coordinator aborts whatever the party is
//! waiting on.

use crate::curve::{address, encode_point, scalar_from_biguint};
use crate::identity::PersistentSeed;
use crate::messages::{
    kind, CommitmentMessage, CommitmentPayload, ErrorMessage, FragmentPayload, GroupKeyMessage,
    PartialSignatureMessage, ReadyMessage, RegisterMessage, RegisteredMessage, SignRequestMessage,
    SignatureFragment, SignatureResultMessage, StartMessage,
};
use crate::mpc::{read_json, send_json, Peer, Transport};
use crate::sharing::{x_coordinate, Polynomial, PrimeField, Share};
use crate::sign::{message_hash, verify_signature};
use crate::tss::{EngineContext, RelayTssEngine, TssEngine};
use crate::{
    curve, Error, KeyShare, PartyIndex, Result, Scheme, SessionId, Signature,
    DEFAULT_PHASE_TIMEOUT,
};
use k256::ProjectivePoint;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Result of one signing round as seen by a party
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub request_id: String,
    /// Whether this party was asked for a fragment and sent one
    pub contributed: bool,
    pub signature: Option<Signature>,
    pub error: Option<String>,
}

impl RoundOutcome {
    pub fn is_ok(&self) -> bool {
        self.signature.is_some()
    }
}

/// First fatal coordinator `error` of a session, once one has arrived
#[derive(Clone)]
struct FatalError(watch::Receiver<Option<ErrorMessage>>);

impl FatalError {
    /// Resolves once a fatal error has been reported, and immediately after that
    async fn wait(&mut self) -> ErrorMessage {
        let reported = match self.0.wait_for(Option::is_some).await {
            Ok(message) => (*message).clone(),
            Err(_) => None,
        };
        match reported {
            Some(message) => message,
            None => std::future::pending().await,
        }
    }
}

/// Listens for coordinator `error` messages for as long as the party lives
struct ErrorWatch {
    fatal: FatalError,
    task: JoinHandle<()>,
}

impl ErrorWatch {
    fn spawn(transport: Arc<dyn Transport>, session_id: String, party_index: PartyIndex) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            loop {
                let read = read_json::<_, ErrorMessage>(
                    transport.as_ref(),
                    &session_id,
                    Peer::Coordinator,
                    Peer::Party(party_index),
                    kind::ERROR,
                )
                .await;
                match read {
                    Ok(message) if message.fatal => {
                        warn!(
                            session_id = %session_id,
                            message = %message.message,
                            "Session failed"
                        );
                        tx.send_replace(Some(message));
                        break;
                    }
                    Ok(message) => {
                        warn!(message = %message.message, "Coordinator reported an error")
                    }
                    Err(e) => {
                        warn!(error = %e, "Error listener read failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });
        Self {
            fatal: FatalError(rx),
            task,
        }
    }
}

impl Drop for ErrorWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One signer
pub struct Party {
    transport: Arc<dyn Transport>,
    engine: Arc<dyn TssEngine>,
    party_index: PartyIndex,
    seed: PersistentSeed,
    timeout: Duration,
    /// One error listener per session this party has joined
    error_watches: DashMap<SessionId, ErrorWatch>,
}

impl Party {
    pub fn new(
        transport: Arc<dyn Transport>,
        party_index: PartyIndex,
        seed: PersistentSeed,
    ) -> Self {
        Self {
            transport,
            engine: Arc::new(RelayTssEngine::new()),
            party_index,
            seed,
            timeout: DEFAULT_PHASE_TIMEOUT,
            error_watches: DashMap::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn TssEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Bound on every wait
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn party_index(&self) -> PartyIndex {
        self.party_index
    }

    /// Register and run key generation to completion.
    ///
    /// `threshold` / `total_parties` are what this party was configured with;
    /// the coordinator fails the session if they disagree with its own.
    #[instrument(skip(self), fields(party_index = self.party_index))]
    pub async fn run_dkg(
        &self,
        session_id: &str,
        threshold: Option<usize>,
        total_parties: Option<usize>,
    ) -> Result<KeyShare> {
        let mut errors = self.watch_errors(session_id);

        self.send(
            session_id,
            kind::REGISTER,
            &RegisterMessage {
                party_index: self.party_index,
                threshold,
                total_parties,
            },
        )
        .await?;

        let registered: RegisteredMessage =
            self.expect(session_id, kind::REGISTERED, &mut errors).await?;
        if registered.session_id != session_id {
            return Err(Error::InvalidConfig(format!(
                "registered for session {}, expected {}",
                registered.session_id, session_id
            )));
        }
        info!(
            threshold = registered.threshold,
            total_parties = registered.total_parties,
            scheme = %registered.scheme,
            "Registered"
        );

        let start: StartMessage = self.expect(session_id, kind::START, &mut errors).await?;
        if let Some(seed) = &start.session_seed {
            debug!(session_seed = %seed, "Session seed received");
        }

        let key = match registered.scheme {
            Scheme::Reconstruction => {
                self.dkg_reconstruction(session_id, &registered, &mut errors).await?
            }
            Scheme::Threshold => self.dkg_threshold(session_id, &registered, &mut errors).await?,
        };

        self.send(
            session_id,
            kind::READY,
            &ReadyMessage {
                party_index: self.party_index,
            },
        )
        .await?;

        info!(address = %key.address, "Key generation complete");
        Ok(key)
    }

    async fn dkg_reconstruction(
        &self,
        session_id: &str,
        registered: &RegisteredMessage,
        errors: &mut FatalError,
    ) -> Result<KeyShare> {
        let field = PrimeField::secp256k1();
        let polynomial = field.generate_polynomial(registered.threshold, &mut OsRng)?;

        self.send(
            session_id,
            kind::COMMITMENT,
            &CommitmentMessage {
                party_index: self.party_index,
                payload: CommitmentPayload::Polynomial {
                    polynomial: polynomial.clone(),
                },
            },
        )
        .await?;

        let group: GroupKeyMessage = self.expect(session_id, kind::GROUP_KEY, errors).await?;
        let polynomials = group
            .polynomials
            .ok_or_else(|| Error::InvalidConfig("group_key without polynomials".into()))?;
        if polynomials.len() != registered.total_parties {
            return Err(Error::InsufficientParticipants {
                required: registered.total_parties,
                actual: polynomials.len(),
            });
        }
        if polynomials.get(self.party_index) != Some(&polynomial) {
            return Err(Error::VerificationFailed(
                "own polynomial missing from the group set".into(),
            ));
        }

        let combined = field.sum_polynomials(&polynomials)?;
        let secret_point = combined
            .constant_term()
            .map(|c| scalar_from_biguint(c).map(|s| ProjectivePoint::GENERATOR * s))
            .transpose()?
            .ok_or_else(|| Error::InvalidConfig("empty polynomial".into()))?;
        if encode_point(&secret_point) != group.group_public_key {
            return Err(Error::VerificationFailed(
                "polynomial set does not match the group key".into(),
            ));
        }

        let share = field.share_for(&combined, self.party_index);
        let public_shares = public_shares(&field, &combined, registered.total_parties)?;

        Ok(KeyShare {
            session_id: session_id.to_string(),
            party_index: self.party_index,
            total_parties: registered.total_parties,
            threshold: registered.threshold,
            scheme: Scheme::Reconstruction,
            secret_share: scalar_from_biguint(&share.y)?,
            group_key: group.group_public_key,
            address: address(&secret_point),
            public_shares,
        })
    }

    async fn dkg_threshold(
        &self,
        session_id: &str,
        registered: &RegisteredMessage,
        errors: &mut FatalError,
    ) -> Result<KeyShare> {
        let share = self.seed.derive(session_id, self.party_index)?;
        let point = ProjectivePoint::GENERATOR * share;

        self.send(
            session_id,
            kind::COMMITMENT,
            &CommitmentMessage {
                party_index: self.party_index,
                payload: CommitmentPayload::PublicKey {
                    point: encode_point(&point),
                },
            },
        )
        .await?;

        let group: GroupKeyMessage = self.expect(session_id, kind::GROUP_KEY, errors).await?;
        let ctx = self.engine_context(session_id, registered.threshold, registered.total_parties);
        let key = guarded(self.engine.setup(&ctx, share, &group.group_public_key), errors).await?;

        if key.address != group.address {
            return Err(Error::VerificationFailed("engine key address differs".into()));
        }
        Ok(key)
    }

    /// Answer one signing request
    #[instrument(
        skip(self, key),
        fields(party_index = self.party_index, session_id = %key.session_id)
    )]
    pub async fn sign_round(&self, key: &KeyShare) -> Result<RoundOutcome> {
        let session_id = key.session_id.as_str();
        let mut errors = self.watch_errors(session_id);

        let request: SignRequestMessage =
            self.expect(session_id, kind::SIGN_REQUEST, &mut errors).await?;
        let hash = message_hash(&request.message);
        let contributed = request.signers.contains(&self.party_index);

        if contributed {
            info!(request_id = %request.request_id, signers = ?request.signers, "Signing");
            let message = match self.fragment(key, &request, &hash, &mut errors).await {
                Ok(fragment) => PartialSignatureMessage {
                    party_index: self.party_index,
                    request_id: request.request_id.clone(),
                    fragment: Some(fragment),
                    error: None,
                },
                Err(e) => {
                    warn!(
                        request_id = %request.request_id,
                        error = %e,
                        "Could not produce a fragment"
                    );
                    PartialSignatureMessage {
                        party_index: self.party_index,
                        request_id: request.request_id.clone(),
                        fragment: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            self.send(session_id, kind::PARTIAL_SIGNATURE, &message).await?;
        } else {
            debug!(request_id = %request.request_id, "Not a signer for this request");
        }

        let result = loop {
            let result: SignatureResultMessage =
                self.expect(session_id, kind::SIGNATURE_RESULT, &mut errors).await?;
            if result.request_id == request.request_id {
                break result;
            }
            debug!(request_id = %result.request_id, "Skipping result of an earlier request");
        };

        let mut outcome = RoundOutcome {
            request_id: result.request_id,
            contributed,
            signature: None,
            error: result.error,
        };
        match result.signature.filter(|_| result.ok) {
            Some(signature) => match verify_signature(&key.group_key, &hash, &signature) {
                Ok(()) => {
                    info!(
                        request_id = %outcome.request_id,
                        r = hex::encode(signature.r),
                        "Signature verified"
                    );
                    outcome.signature = Some(signature);
                }
                Err(e) => outcome.error = Some(e.to_string()),
            },
            None => {
                warn!(
                    request_id = %outcome.request_id,
                    error = ?outcome.error,
                    "Signing round failed"
                );
            }
        }
        Ok(outcome)
    }

    async fn fragment(
        &self,
        key: &KeyShare,
        request: &SignRequestMessage,
        hash: &[u8; 32],
        errors: &mut FatalError,
    ) -> Result<SignatureFragment> {
        let payload = match key.scheme {
            Scheme::Reconstruction => FragmentPayload::Share {
                share: Share::new(
                    x_coordinate(key.party_index),
                    curve::biguint_from_scalar(&key.secret_share),
                ),
            },
            Scheme::Threshold => {
                let ctx = self.engine_context(&key.session_id, key.threshold, key.total_parties);
                let presignature = guarded(
                    self.engine
                        .precompute(&ctx, key, &request.request_id, &request.signers),
                    errors,
                )
                .await?;
                FragmentPayload::Engine {
                    data: self.engine.partial_sign(key, &presignature, hash)?,
                }
            }
        };

        Ok(SignatureFragment {
            party_index: self.party_index,
            request_id: request.request_id.clone(),
            payload,
        })
    }

    fn engine_context<'a>(
        &'a self,
        session_id: &'a str,
        threshold: usize,
        total_parties: usize,
    ) -> EngineContext<'a> {
        EngineContext {
            transport: self.transport.as_ref(),
            session_id,
            party_index: self.party_index,
            threshold,
            total_parties,
            timeout: self.timeout,
        }
    }

    fn watch_errors(&self, session_id: &str) -> FatalError {
        self.error_watches
            .entry(session_id.to_string())
            .or_insert_with(|| {
                ErrorWatch::spawn(
                    Arc::clone(&self.transport),
                    session_id.to_string(),
                    self.party_index,
                )
            })
            .fatal
            .clone()
    }

    async fn send<M: Serialize + Sync>(
        &self,
        session_id: &str,
        kind: &str,
        message: &M,
    ) -> Result<()> {
        send_json(
            self.transport.as_ref(),
            session_id,
            Peer::Party(self.party_index),
            Peer::Coordinator,
            kind,
            message,
        )
        .await
    }

    /// Next coordinator message of `kind`, bounded by the party timeout
    async fn expect<M: DeserializeOwned>(
        &self,
        session_id: &str,
        kind: &str,
        errors: &mut FatalError,
    ) -> Result<M> {
        let read = read_json(
            self.transport.as_ref(),
            session_id,
            Peer::Coordinator,
            Peer::Party(self.party_index),
            kind,
        );
        let bounded = async {
            tokio::time::timeout(self.timeout, read)
                .await
                .map_err(|_| Error::PartyTimeout(kind.to_string()))?
        };
        guarded(bounded, errors).await
    }
}

/// Run `step` unless the coordinator reports a fatal error first
async fn guarded<T, F>(step: F, errors: &mut FatalError) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        result = step => result,
        error = errors.wait() => Err(Error::Coordinator(error.message)),
    }
}

/// `combined(j)·G` for every party j
fn public_shares(
    field: &PrimeField,
    combined: &Polynomial,
    total_parties: usize,
) -> Result<Vec<Vec<u8>>> {
    (0..total_parties)
        .map(|party| {
            let y: BigUint = field.share_for(combined, party).y;
            Ok(encode_point(&(ProjectivePoint::GENERATOR * scalar_from_biguint(&y)?)))
        })
        .collect()
}
