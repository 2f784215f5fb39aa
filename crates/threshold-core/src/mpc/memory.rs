//! In-memory transport backed by the rendezvous mailbox

use super::{async_trait, Peer, Transport};
use crate::Result;
use msg_relay::{Mailbox, MailboxStats};
use std::time::Duration;

/// In-process rendezvous transport
///
/// Useful for:
/// - Unit and integration testing
/// - Single-process multi-party simulation
#[derive(Clone, Default)]
pub struct MemoryTransport {
    mailbox: Mailbox,
}

impl MemoryTransport {
    /// Create a new in-memory transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stale-reader diagnostic interval
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            mailbox: Mailbox::default().with_stale_after(stale_after),
        }
    }

    /// Queued / waiting counters of the underlying mailbox
    pub fn stats(&self) -> MailboxStats {
        self.mailbox.stats()
    }

    /// Drop everything queued for a session
    pub fn clear_session(&self, session_id: &str) {
        self.mailbox.clear_session(session_id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.mailbox.send(session_id, from, to, kind, payload);
        Ok(())
    }

    async fn read(&self, session_id: &str, from: Peer, to: Peer, kind: &str) -> Result<Vec<u8>> {
        Ok(self.mailbox.read(session_id, from, to, kind).await?)
    }
}
