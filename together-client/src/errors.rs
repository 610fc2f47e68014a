use std::io;

use thiserror::Error;
use together_core::{ErrorKind, ProtocolError};
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Session channel failed: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Local file error: {0}")]
    Io(#[from] io::Error),
    #[error("Server refused: {message}")]
    Server { kind: ErrorKind, message: String },
    #[error("Clip checksum mismatch, expected {expected} but got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("The session channel closed")]
    Closed,
}

impl ClientError {
    /// Whether reconnecting could make a difference.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { kind, message: _ } => {
                !matches!(kind, ErrorKind::NotFound | ErrorKind::Forbidden)
            }
            Self::Protocol(_) | Self::Integrity { .. } => false,
            _ => true,
        }
    }
}
