//! Per-session actor
//!
//! The actor owns the [`Session`] and is the only place it is mutated.
//! Listener tasks, one per party and inbound kind, read the transport and
//! forward decoded messages as [`Event`]s; API calls arrive on the same
//! channel.

use super::session::{Event, Outbound, Phase, Session, WireMessage};
use super::{SessionHandle, SessionStatus};
use crate::messages::{
    kind, CommitmentMessage, PartialSignatureMessage, ReadyMessage, RegisterMessage,
};
use crate::mpc::{read_json, Peer, Transport};
use crate::{Error, PartyIndex, Result, SessionId, Signature};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 256;
const LISTENER_RETRY: Duration = Duration::from_millis(500);

pub(crate) enum Command {
    Event(Event),
    Sign {
        message: Vec<u8>,
        signers: Option<Vec<PartyIndex>>,
        reply: oneshot::Sender<Result<Signature>>,
    },
    Close,
}

struct SessionActor {
    session: Session,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SessionStatus>,
    pending: HashMap<String, oneshot::Sender<Result<Signature>>>,
    listeners: JoinSet<()>,
}

/// Start the actor and its listeners; returns the handle that drives them
pub(crate) fn spawn(session: Session, transport: Arc<dyn Transport>) -> SessionHandle {
    let config = session.config().clone();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (status_tx, status_rx) = watch::channel(SessionStatus::of(&session));

    let mut listeners = JoinSet::new();
    for party in config.parties() {
        let listener = Listener {
            transport: Arc::clone(&transport),
            session_id: config.session_id.clone(),
            party,
            commands: command_tx.clone(),
        };
        listener.clone().spawn(&mut listeners, kind::REGISTER, |from, message: RegisterMessage| {
            Event::Register { from, message }
        });
        listener.clone().spawn(
            &mut listeners,
            kind::COMMITMENT,
            |from, message: CommitmentMessage| Event::Commitment { from, message },
        );
        listener.clone().spawn(&mut listeners, kind::READY, |from, _: ReadyMessage| Event::Ready {
            from,
        });
        listener.spawn(
            &mut listeners,
            kind::PARTIAL_SIGNATURE,
            |from, message: PartialSignatureMessage| Event::PartialSignature { from, message },
        );
    }

    let actor = SessionActor {
        session,
        transport,
        commands: command_rx,
        status: status_tx,
        pending: HashMap::new(),
        listeners,
    };
    tokio::spawn(actor.run());

    SessionHandle {
        config: Arc::new(config),
        commands: command_tx,
        status: status_rx,
    }
}

#[derive(Clone)]
struct Listener {
    transport: Arc<dyn Transport>,
    session_id: SessionId,
    party: PartyIndex,
    commands: mpsc::Sender<Command>,
}

impl Listener {
    fn spawn<M, F>(self, tasks: &mut JoinSet<()>, kind: &'static str, to_event: F)
    where
        M: DeserializeOwned + Send + 'static,
        F: Fn(PartyIndex, M) -> Event + Send + 'static,
    {
        tasks.spawn(async move {
            loop {
                let read = read_json::<_, M>(
                    self.transport.as_ref(),
                    &self.session_id,
                    Peer::Party(self.party),
                    Peer::Coordinator,
                    kind,
                )
                .await;

                match read {
                    Ok(message) => {
                        let event = to_event(self.party, message);
                        if self.commands.send(Command::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::Deserialization(e)) => {
                        warn!(
                            party_index = self.party,
                            kind,
                            error = %e,
                            "Dropping malformed message"
                        );
                    }
                    Err(e) => {
                        warn!(
                            party_index = self.party,
                            kind,
                            error = %e,
                            "Listener read failed, retrying"
                        );
                        tokio::time::sleep(LISTENER_RETRY).await;
                    }
                }
            }
        });
    }
}

impl SessionActor {
    async fn run(mut self) {
        let session_id = self.session.config().session_id.clone();
        let phase_timeout = self.session.config().phase_timeout;
        let mut phase = self.session.phase();
        let mut deadline = Some(Instant::now() + phase_timeout);

        info!(session_id = %session_id, "Session opened");

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = timer => Some(Command::Event(Event::Timeout)),
            };

            match command {
                None | Some(Command::Close) => break,
                Some(Command::Event(event)) => self.apply(event).await,
                Some(Command::Sign {
                    message,
                    signers,
                    reply,
                }) => {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    self.pending.insert(request_id.clone(), reply);
                    self.apply(Event::SignRequest {
                        request_id,
                        message,
                        signers,
                    })
                    .await;
                }
            }

            let current = self.session.phase();
            if current != phase {
                debug!(session_id = %session_id, from = %phase, to = %current, "Phase transition");
                phase = current;
                deadline = current
                    .is_awaiting_parties()
                    .then(|| Instant::now() + phase_timeout);
            }
            if current == Phase::Failed {
                break;
            }
        }

        self.listeners.abort_all();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(Error::Coordinator("session closed".into())));
        }
        info!(session_id = %session_id, phase = %self.session.phase(), "Session closed");
    }

    async fn apply(&mut self, event: Event) {
        for outbound in self.session.apply(event) {
            self.deliver(outbound).await;
        }
        self.status.send_replace(SessionStatus::of(&self.session));
    }

    async fn deliver(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Party { to, message } => self.send(to, &message).await,
            Outbound::Broadcast(message) => {
                for party in self.session.config().parties() {
                    self.send(party, &message).await;
                }
            }
            Outbound::SignOutcome { request_id, result } => {
                if let Some(reply) = self.pending.remove(&request_id) {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn send(&self, to: PartyIndex, message: &WireMessage) {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(kind = message.kind(), error = %e, "Failed to encode message");
                return;
            }
        };

        let session_id = &self.session.config().session_id;
        if let Err(e) = self
            .transport
            .send(session_id, Peer::Coordinator, Peer::Party(to), message.kind(), payload)
            .await
        {
            warn!(party_index = to, kind = message.kind(), error = %e, "Failed to deliver message");
        }
    }
}
