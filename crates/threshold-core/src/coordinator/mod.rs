//! Session coordinator
//!
//! The coordinator owns every session's lifecycle: it collects registrations,
//! commitments and readiness acknowledgements from the parties, aggregates
//! the group key, fans out signing requests and combines the returned
//! fragments. Each session runs in its own actor task; independent sessions
//! proceed in parallel.
//!
//! ```rust,ignore
//! let coordinator = Coordinator::new(Arc::new(MemoryTransport::new()));
//! let session = coordinator.open_session(SessionConfig::new(3, 2, Scheme::Threshold)?)?;
//! session.wait_for_phase(Phase::SigningReady).await?;
//! let signature = session.sign(b"hello", None).await?;
//! ```

mod actor;
mod session;

pub use session::{Event, Outbound, Phase, Session, WireMessage};

use crate::mpc::Transport;
use crate::tss::{RelayTssEngine, TssEngine};
use crate::{Error, PartyIndex, Result, SessionConfig, SessionId, Signature};
use actor::Command;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, instrument};

/// Snapshot of a session, published after every transition
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: Phase,
    pub participants: Vec<PartyIndex>,
    pub group_key: Option<Vec<u8>>,
    pub address: Option<String>,
    pub last_signature: Option<Signature>,
    pub failure: Option<String>,
}

impl SessionStatus {
    fn of(session: &Session) -> Self {
        Self {
            phase: session.phase(),
            participants: session.participants(),
            group_key: session.group_key().map(<[u8]>::to_vec),
            address: session.address().map(str::to_string),
            last_signature: session.last_signature().cloned(),
            failure: session.failure().map(str::to_string),
        }
    }
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    config: Arc<SessionConfig>,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    /// Compressed group public key, once every commitment is in
    pub fn group_key(&self) -> Option<Vec<u8>> {
        self.status.borrow().group_key.clone()
    }

    pub fn address(&self) -> Option<String> {
        self.status.borrow().address.clone()
    }

    /// Wait until the session reaches `phase`.
    ///
    /// Fails if the session moves to `Failed` first.
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<SessionStatus> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.phase == phase || s.phase == Phase::Failed)
            .await
            .map_err(|_| Error::Coordinator("session actor stopped".into()))?
            .clone();

        if reached.phase == Phase::Failed && phase != Phase::Failed {
            return Err(Error::Coordinator(
                reached.failure.unwrap_or_else(|| "session failed".into()),
            ));
        }
        Ok(reached)
    }

    /// Run one signing round over `message`.
    ///
    /// `signers` defaults to the lowest `K` ready parties.
    pub async fn sign(
        &self,
        message: &[u8],
        signers: Option<Vec<PartyIndex>>,
    ) -> Result<Signature> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Sign {
                message: message.to_vec(),
                signers,
                reply,
            })
            .await
            .map_err(|_| Error::Coordinator("session closed".into()))?;

        outcome
            .await
            .map_err(|_| Error::Coordinator("session closed".into()))?
    }

    /// Stop the session actor and its listeners
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

/// Registry of running sessions
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    engine: Arc<dyn TssEngine>,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl Coordinator {
    /// Coordinator using the in-tree TSS engine
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_engine(transport, Arc::new(RelayTssEngine::new()))
    }

    pub fn with_engine(transport: Arc<dyn Transport>, engine: Arc<dyn TssEngine>) -> Self {
        Self {
            transport,
            engine,
            sessions: DashMap::new(),
        }
    }

    /// Open a session in `Forming` and start listening for registrations
    #[instrument(skip(self, config), fields(session_id = %config.session_id))]
    pub fn open_session(&self, config: SessionConfig) -> Result<SessionHandle> {
        config.validate()?;

        match self.sessions.entry(config.session_id.clone()) {
            Entry::Occupied(_) => Err(Error::InvalidConfig(format!(
                "session {} is already open",
                config.session_id
            ))),
            Entry::Vacant(entry) => {
                info!(
                    threshold = config.threshold,
                    total_parties = config.total_parties,
                    scheme = %config.scheme,
                    "Opening session"
                );
                let session = Session::new(config, Arc::clone(&self.engine));
                let handle = actor::spawn(session, Arc::clone(&self.transport));
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn session(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close and forget a session
    pub async fn remove_session(&self, session_id: &str) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(session_id)?;
        handle.close().await;
        Some(handle)
    }
}
