//! Protocol error types

use thiserror::Error;

/// Errors that can occur while reading or writing the wire protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The init frame (or stream chunk) could not be parsed as JSON
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
