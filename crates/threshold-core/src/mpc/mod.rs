//! Rendezvous transport used by the coordinator, the parties and the TSS engine

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

pub use ::async_trait::async_trait;
pub use msg_relay::Peer;

/// Keyed asynchronous mailbox.
///
/// `read` returns the oldest payload sent on `(session, from, to, kind)` or
/// waits for one. Endpoint order does not matter. Implementations do not time
/// out reads; callers bound them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue a payload
    async fn send(&self, session_id: &str, from: Peer, to: Peer, kind: &str, payload: Vec<u8>)
        -> Result<()>;

    /// Wait for the next payload on a key
    async fn read(&self, session_id: &str, from: Peer, to: Peer, kind: &str) -> Result<Vec<u8>>;
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Send a JSON-encoded message
pub async fn send_json<T, M>(
    transport: &T,
    session_id: &str,
    from: Peer,
    to: Peer,
    kind: &str,
    message: &M,
) -> Result<()>
where
    T: Transport + ?Sized,
    M: Serialize + ?Sized,
{
    trace!(session_id, %from, %to, kind, "send");
    transport
        .send(session_id, from, to, kind, serialize(message)?)
        .await
}

/// Read and decode a JSON message
pub async fn read_json<T, M>(
    transport: &T,
    session_id: &str,
    from: Peer,
    to: Peer,
    kind: &str,
) -> Result<M>
where
    T: Transport + ?Sized,
    M: DeserializeOwned,
{
    let bytes = transport.read(session_id, from, to, kind).await?;
    trace!(session_id, %from, %to, kind, "read");
    deserialize(&bytes)
}

/// In-memory transport for tests and single-process runs
pub mod memory;

pub use memory::MemoryTransport;
