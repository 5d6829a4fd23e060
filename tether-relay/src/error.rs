//! Error types for tether-relay.

use std::path::PathBuf;
use tether_types::{EndpointKind, TypesError};

/// Main error type for tether-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Inbound event errors. Always logged and dropped; never sent to the peer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame failed to decode or validate.
    #[error("invalid event: {0}")]
    Decode(#[from] TypesError),

    /// Frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Actual size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Sender's role or ownership does not permit the action.
    #[error("{kind} endpoint may not {action}: {reason}")]
    Unauthorized {
        /// Sender role.
        kind: EndpointKind,
        /// Attempted action (event name).
        action: &'static str,
        /// Why it was refused.
        reason: String,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },
}

/// Handshake authentication errors. Any of these closes the transport unregistered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No bearer credential was presented.
    #[error("missing credential")]
    MissingCredential,

    /// The credential is unknown or expired.
    #[error("invalid credential")]
    InvalidCredential,

    /// The credential resolved to an unusable identity.
    #[error("identity rejected: {0}")]
    IdentityRejected(String),

    /// The relay refuses new connections right now.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Failure to hand a frame to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,

    /// The connection's outbound buffer is full.
    #[error("outbound buffer full")]
    Full,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
