//! Message Relay Library
//!
//! Rendezvous mailbox used by coordinators, parties and the TSS engine to
//! exchange session-scoped messages.
//!
//! A message is addressed by `(session, from, to, kind)`. The two endpoints are
//! stored in canonical order, so a reader asking for `(to, from, kind)` is served
//! by a send addressed `(from, to, kind)`. Within one key, queued messages and
//! waiting readers are both FIFO and every message is delivered exactly once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Mailbox closed while waiting on {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// How long a reader may wait before a diagnostic is logged.
pub const DEFAULT_STALE_READER: Duration = Duration::from_secs(30);

/// One end of a mailbox.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    Coordinator,
    Party(usize),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Coordinator => write!(f, "coordinator"),
            Peer::Party(index) => write!(f, "party-{}", index),
        }
    }
}

impl FromStr for Peer {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "coordinator" {
            return Ok(Peer::Coordinator);
        }
        s.strip_prefix("party-")
            .and_then(|index| index.parse().ok())
            .map(Peer::Party)
            .ok_or_else(|| RelayError::InvalidPeer(s.to_string()))
    }
}

/// Canonical mailbox key
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MailboxKey {
    /// Session identifier
    pub session_id: String,
    /// Lower endpoint
    pub low: Peer,
    /// Higher endpoint
    pub high: Peer,
    /// Message kind
    pub kind: String,
}

impl MailboxKey {
    /// Create a key; endpoint order does not matter
    pub fn new(session_id: &str, from: Peer, to: Peer, kind: &str) -> Self {
        let (low, high) = if from <= to { (from, to) } else { (to, from) };
        Self {
            session_id: session_id.to_string(),
            low,
            high,
            kind: kind.to_string(),
        }
    }

    /// Short digest used in logs and API responses
    pub fn digest(&self) -> String {
        let data = format!("{}:{}:{}:{}", self.session_id, self.low, self.high, self.kind);
        hex::encode(&blake3::hash(data.as_bytes()).as_bytes()[..16])
    }
}

/// Stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Message identifier
    pub id: Uuid,
    /// Sender as named by the send call
    pub from: Peer,
    /// Receiver as named by the send call
    pub to: Peer,
    /// Message payload
    pub payload: Vec<u8>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Expiration timestamp
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    queued: VecDeque<StoredMessage>,
    waiters: VecDeque<oneshot::Sender<StoredMessage>>,
}

impl Slot {
    /// Hand the message to the oldest live waiter, or give it back.
    fn hand_off(&mut self, mut message: StoredMessage) -> Option<StoredMessage> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return None,
                Err(returned) => message = returned,
            }
        }
        Some(message)
    }

    fn pop_live(&mut self, now: DateTime<Utc>) -> Option<StoredMessage> {
        while let Some(message) = self.queued.pop_front() {
            if message.expires_at > now {
                return Some(message);
            }
            debug!(id = %message.id, "Dropping expired message");
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.waiters.is_empty()
    }
}

/// Mailbox counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    /// Keys with queued messages or waiting readers
    pub keys: usize,
    /// Messages waiting for a reader
    pub queued: usize,
    /// Readers waiting for a message
    pub waiting: usize,
}

/// Rendezvous mailbox store
#[derive(Clone)]
pub struct Mailbox {
    slots: Arc<DashMap<MailboxKey, Slot>>,
    /// Queued message TTL in seconds
    ttl_seconds: i64,
    /// Interval between stale-reader diagnostics
    stale_after: Duration,
}

impl Mailbox {
    /// Create a new mailbox
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl_seconds,
            stale_after: DEFAULT_STALE_READER,
        }
    }

    /// Set the stale-reader diagnostic interval
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Enqueue a message, or deliver it to the oldest waiting reader
    pub fn send(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
        payload: Vec<u8>,
    ) -> MailboxKey {
        let key = MailboxKey::new(session_id, from, to, kind);
        let now = Utc::now();
        let message = StoredMessage {
            id: Uuid::new_v4(),
            from,
            to,
            payload,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.ttl_seconds),
        };

        let mut slot = self.slots.entry(key.clone()).or_default();
        match slot.hand_off(message) {
            None => debug!(key = %key.digest(), %from, %to, kind, "Delivered to waiting reader"),
            Some(message) => {
                debug!(key = %key.digest(), %from, %to, kind, "Queued message");
                slot.queued.push_back(message);
            }
        }
        key
    }

    /// Take the oldest queued message without waiting
    pub fn try_read(&self, session_id: &str, from: Peer, to: Peer, kind: &str) -> Option<Vec<u8>> {
        let key = MailboxKey::new(session_id, from, to, kind);
        let mut slot = self.slots.get_mut(&key)?;
        slot.pop_live(Utc::now()).map(|m| m.payload)
    }

    /// Wait for the next message on a key.
    ///
    /// The read never fails on its own: a reader waiting longer than the
    /// stale interval logs a warning and keeps waiting. Dropping the future is
    /// safe; a message already handed to it is put back at the head of the key.
    pub async fn read(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
    ) -> Result<Vec<u8>> {
        let key = MailboxKey::new(session_id, from, to, kind);
        let mut pending = {
            let mut slot = self.slots.entry(key.clone()).or_default();
            if let Some(message) = slot.pop_live(Utc::now()) {
                return Ok(message.payload);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(tx);
            PendingRead {
                rx: Some(rx),
                key: key.clone(),
                slots: Arc::clone(&self.slots),
            }
        };

        let started = Instant::now();
        loop {
            tokio::select! {
                delivered = pending.recv() => {
                    return delivered
                        .map(|m| m.payload)
                        .ok_or_else(|| RelayError::Closed(key.digest()));
                }
                _ = tokio::time::sleep(self.stale_after) => {
                    warn!(
                        key = %key.digest(),
                        session_id = %key.session_id,
                        kind = %key.kind,
                        waited_secs = started.elapsed().as_secs(),
                        "Reader still waiting for a matching send"
                    );
                }
            }
        }
    }

    /// Wait at most `window` for a message; `None` when nothing arrived
    pub async fn read_within(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
        window: Duration,
    ) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(window, self.read(session_id, from, to, kind)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Remove expired messages, abandoned readers and idle keys
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.slots.retain(|_, slot| {
            slot.queued.retain(|m| m.expires_at > now);
            slot.waiters.retain(|w| !w.is_closed());
            !slot.is_idle()
        });
    }

    /// Drop everything queued for a session
    pub fn clear_session(&self, session_id: &str) {
        self.slots.retain(|key, _| key.session_id != session_id);
    }

    /// Current counters
    pub fn stats(&self) -> MailboxStats {
        let mut stats = MailboxStats::default();
        for entry in self.slots.iter() {
            let waiting = entry.waiters.iter().filter(|w| !w.is_closed()).count();
            if entry.queued.is_empty() && waiting == 0 {
                continue;
            }
            stats.keys += 1;
            stats.queued += entry.queued.len();
            stats.waiting += waiting;
        }
        stats
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new(3600) // 1 hour default TTL
    }
}

/// A registered reader. Returns an undelivered message to the key on drop.
struct PendingRead {
    rx: Option<oneshot::Receiver<StoredMessage>>,
    key: MailboxKey,
    slots: Arc<DashMap<MailboxKey, Slot>>,
}

impl PendingRead {
    async fn recv(&mut self) -> Option<StoredMessage> {
        let rx = self.rx.as_mut()?;
        let message = rx.await.ok();
        self.rx = None;
        message
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        if let Ok(message) = rx.try_recv() {
            let mut slot = self.slots.entry(self.key.clone()).or_default();
            if let Some(message) = slot.hand_off(message) {
                slot.queued.push_front(message);
            }
        }
    }
}
