//! Error types for threshold key generation and signing

use thiserror::Error;

/// Result type alias for threshold operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during session coordination and signing
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid session or party configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A party index registered twice in one session
    #[error("Party {0} is already registered")]
    DuplicateParty(usize),

    /// Party index outside `[0, N)`
    #[error("Invalid party index: {0}")]
    InvalidPartyIndex(usize),

    /// Aggregation attempted before the full participant set reported
    #[error("Insufficient participants: required {required}, got {actual}")]
    InsufficientParticipants { required: usize, actual: usize },

    /// Modular inverse of a value that shares a factor with the modulus
    #[error("Value is not invertible modulo the field order")]
    NonInvertible,

    /// Two interpolation points share an x-coordinate
    #[error("Duplicate x-coordinate in interpolation input: {0}")]
    DuplicateXCoordinate(u64),

    /// A suspension point exceeded its configured bound
    #[error("Timed out waiting for {0}")]
    PartyTimeout(String),

    /// Combined signature or received share failed verification
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Message not valid in the current session phase
    #[error("Unexpected {kind} message in phase {phase}")]
    UnexpectedMessage { kind: String, phase: String },

    /// The coordinator reported a session error
    #[error("Coordinator reported: {0}")]
    Coordinator(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Local storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error ends the session rather than a single attempt
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::DuplicateParty(_)
                | Error::InvalidPartyIndex(_)
                | Error::UnexpectedMessage { .. }
                | Error::VerificationFailed(_)
                | Error::Relay(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<msg_relay::RelayError> for Error {
    fn from(e: msg_relay::RelayError) -> Self {
        Error::Relay(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
