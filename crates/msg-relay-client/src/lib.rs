//! Message Relay Client
//!
//! [`Transport`] implementation backed by the `msg-relay-svc` HTTP service.

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use threshold_core::mpc::{async_trait, Peer, Transport};
use threshold_core::{Error, Result};
use tracing::{debug, instrument, trace};

/// Default long-poll window asked of the service
pub const DEFAULT_POLL: Duration = Duration::from_secs(20);

/// HTTP-based relay client
#[derive(Clone)]
pub struct RelayClient {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// Long-poll window per read request
    poll: Duration,
    /// Timeout for send requests
    timeout: Duration,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            poll: DEFAULT_POLL,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the long-poll window
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check that the service answers
    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "health check failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// One long-poll read; `None` if the window closed empty
    #[instrument(skip(self))]
    async fn poll_once(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
    ) -> Result<Option<Vec<u8>>> {
        let req = ReadRequest {
            session_id: session_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.to_string(),
            wait_ms: Some(self.poll.as_millis() as u64),
        };

        let response = self
            .client
            .post(format!("{}/v1/msg/read", self.url))
            .json(&req)
            .timeout(self.poll + self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "read failed with status: {}",
                response.status()
            )));
        }

        let msg_response: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        decode_response(msg_response)
    }
}

fn decode_response(response: MessageResponse) -> Result<Option<Vec<u8>>> {
    match (response.found, response.payload) {
        (true, Some(payload)) => STANDARD
            .decode(payload)
            .map(Some)
            .map_err(|e| Error::Deserialization(e.to_string())),
        (true, None) => Err(Error::Relay("found message without payload".into())),
        (false, _) => Ok(None),
    }
}

#[async_trait]
impl Transport for RelayClient {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn send(
        &self,
        session_id: &str,
        from: Peer,
        to: Peer,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let req = SendRequest {
            session_id: session_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.to_string(),
            payload: STANDARD.encode(&payload),
        };

        let response = self
            .client
            .post(format!("{}/v1/msg", self.url))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "POST failed with status: {}",
                response.status()
            )));
        }

        debug!("Message posted");
        Ok(())
    }

    /// Re-issues the long poll until a message arrives; never times out on its own
    async fn read(&self, session_id: &str, from: Peer, to: Peer, kind: &str) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.poll_once(session_id, from, to, kind).await? {
                return Ok(payload);
            }
            trace!(session_id, %from, %to, kind, "Poll window closed, polling again");
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SendRequest {
    session_id: String,
    from: String,
    to: String,
    kind: String,
    payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadRequest {
    session_id: String,
    from: String,
    to: String,
    kind: String,
    wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageResponse {
    found: bool,
    payload: Option<String>,
}
