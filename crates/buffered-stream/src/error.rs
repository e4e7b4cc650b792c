//! Error types for buffered streams.

use thiserror::Error;

use crate::encoding::Encoding;

/// Reason a call was rejected by the flow state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidState {
    #[error("stream is not writable")]
    NotWritable,

    #[error("stream is already ended")]
    AlreadyEnded,
}

/// Errors that can occur during stream operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Contract violation: write after end, write while not writable,
    /// or a second end.
    #[error("invalid stream state: {0}")]
    InvalidState(#[from] InvalidState),

    #[error("stream is already piped")]
    AlreadyPiped,

    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("invalid {encoding} data: {message}")]
    InvalidData { encoding: Encoding, message: String },

    #[error("invalid stream options: {0}")]
    InvalidOptions(String),

    /// Error reported by a piped source or destination.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An error event was emitted with nobody listening for it.
    #[error("unhandled stream error: {0}")]
    Unhandled(Box<StreamError>),
}

impl StreamError {
    pub fn not_writable() -> Self {
        StreamError::InvalidState(InvalidState::NotWritable)
    }

    pub fn already_ended() -> Self {
        StreamError::InvalidState(InvalidState::AlreadyEnded)
    }

    /// Create an upstream error from anything printable.
    pub fn upstream(message: impl std::fmt::Display) -> Self {
        StreamError::Upstream(message.to_string())
    }
}
