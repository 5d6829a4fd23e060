//! Error types for tether-types.

use thiserror::Error;

/// Errors raised while decoding or validating wire data.
#[derive(Debug, Error)]
pub enum TypesError {
    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid but semantically invalid data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Unparseable group address
    #[error("invalid group address: {0}")]
    InvalidGroup(String),
}
