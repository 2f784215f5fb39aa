//! Message Relay Service
//!
//! HTTP front end for the rendezvous mailbox. Coordinator and parties in
//! different processes exchange session messages through it.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use clap::Parser;
use msg_relay::{Mailbox, Peer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, Level};

/// Message relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "msg-relay-svc")]
#[command(about = "Rendezvous relay for threshold signing sessions")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Message TTL in seconds
    #[arg(long, default_value = "3600")]
    ttl: i64,

    /// Longest a read request is held open, in milliseconds
    #[arg(long, default_value = "25000")]
    max_poll_ms: u64,

    /// Seconds a reader waits before a stale-reader warning
    #[arg(long, default_value = "30")]
    stale_after: u64,
}

/// Application state
struct AppState {
    mailbox: Mailbox,
    max_poll: Duration,
}

/// Request to send a message
#[derive(Debug, Serialize, Deserialize)]
struct SendRequest {
    session_id: String,
    from: String,
    to: String,
    kind: String,
    payload: String, // base64 encoded
}

/// Request to read the next message on a key
#[derive(Debug, Serialize, Deserialize)]
struct ReadRequest {
    session_id: String,
    from: String,
    to: String,
    kind: String,
    /// How long to hold the request open; capped by `--max-poll-ms`
    wait_ms: Option<u64>,
}

/// Message response
#[derive(Debug, Serialize, Deserialize)]
struct MessageResponse {
    found: bool,
    payload: Option<String>, // base64 encoded
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!(
        listen = %args.listen,
        ttl = args.ttl,
        max_poll_ms = args.max_poll_ms,
        "Starting message relay service"
    );

    let state = Arc::new(AppState {
        mailbox: Mailbox::new(args.ttl).with_stale_after(Duration::from_secs(args.stale_after)),
        max_poll: Duration::from_millis(args.max_poll_ms),
    });

    // Spawn cleanup task
    let cleanup_mailbox = state.mailbox.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_mailbox.cleanup();
        }
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/msg", post(send_message))
        .route("/v1/msg/read", post(read_message))
        .route("/v1/stats", get(stats))
        .route("/v1/session/:session_id", delete(clear_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "msg-relay-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

type Rejection = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: String) -> Rejection {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

fn parse_peers(from: &str, to: &str) -> Result<(Peer, Peer), Rejection> {
    let from: Peer = from.parse().map_err(|e: msg_relay::RelayError| bad_request(e.to_string()))?;
    let to: Peer = to.parse().map_err(|e: msg_relay::RelayError| bad_request(e.to_string()))?;
    Ok((from, to))
}

/// Enqueue a message
async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> impl IntoResponse {
    let (from, to) = match parse_peers(&req.from, &req.to) {
        Ok(peers) => peers,
        Err(response) => return response,
    };

    let payload = match b64::decode(&req.payload) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("Invalid base64: {}", e)),
    };

    let key = state.mailbox.send(&req.session_id, from, to, &req.kind, payload);

    debug!(
        session_id = %req.session_id,
        %from,
        %to,
        kind = %req.kind,
        "Message stored"
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({ "key": key.digest() })),
    )
}

/// Long-poll read: answers `found: false` if nothing arrives within the window
async fn read_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReadRequest>,
) -> impl IntoResponse {
    let (from, to) = match parse_peers(&req.from, &req.to) {
        Ok(peers) => peers,
        Err(response) => return response.into_response(),
    };

    let window = req
        .wait_ms
        .map(Duration::from_millis)
        .map_or(state.max_poll, |wait| wait.min(state.max_poll));

    match state
        .mailbox
        .read_within(&req.session_id, from, to, &req.kind, window)
        .await
    {
        Ok(payload) => Json(MessageResponse {
            found: payload.is_some(),
            payload: payload.map(|p| b64::encode(&p)),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Mailbox counters
async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.mailbox.stats())
}

/// Drop everything queued for a session
async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    state.mailbox.clear_session(&session_id);
    info!(session_id = %session_id, "Session cleared");
    StatusCode::NO_CONTENT
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(s)
    }
}
