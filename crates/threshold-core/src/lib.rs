//! # Threshold Core
//!
//! Threshold key generation and signing coordination over secp256k1.
//!
//! This crate provides:
//! - Shamir secret sharing over a prime field (polynomials, Lagrange interpolation)
//! - A coordinator that drives sessions through registration, key generation
//!   and signing
//! - The party (signer) side of the same protocol
//! - A rendezvous transport abstraction with an in-memory implementation
//! - A threshold-ECDSA engine interface and a reference engine
//!
//! ## Schemes
//!
//! Two schemes share the same message flow:
//! - `Reconstruction`: parties exchange whole polynomials through the
//!   coordinator and any `K` shares recover the joint secret. The coordinator
//!   sees every party's secret coefficient. This is custody by
//!   reconstruction, not threshold signing.
//! - `Threshold`: parties publish only `share·G`; signing runs through a
//!   [`tss::TssEngine`] and no single process ever holds the joint secret.
//!
//! ## Example
//!
//! ```rust,ignore
//! use threshold_core::{coordinator::Coordinator, party::Party, SessionConfig, Scheme};
//!
//! let coordinator = Coordinator::new(transport.clone());
//! let session = coordinator.open_session(SessionConfig::new(3, 2, Scheme::Threshold)?)?;
//!
//! // on each party
//! let key = Party::new(transport, index, seed).run_dkg(session.session_id(), None, None).await?;
//!
//! // on the coordinator
//! let signature = session.sign(b"message", None).await?;
//! ```

pub mod coordinator;
pub mod curve;
pub mod error;
pub mod identity;
pub mod messages;
pub mod mpc;
pub mod party;
pub mod sharing;
pub mod sign;
pub mod tss;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    KeyShare, PartyIndex, Scheme, SessionConfig, SessionId, Signature,
    DEFAULT_MAX_SIGNING_RETRIES, DEFAULT_PHASE_TIMEOUT,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default threshold for a 3-party setup
pub const DEFAULT_THRESHOLD: usize = 2;

/// Default number of parties
pub const DEFAULT_PARTIES: usize = 3;
