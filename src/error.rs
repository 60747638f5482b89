//! Error types for the session bridge.

use thiserror::Error;

/// Errors surfaced by the bridge components.
///
/// The variants follow the failure classes the bridge distinguishes when
/// deciding whether to retry, drop, or abort a session.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The relay socket closed, timed out, or refused the handshake.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame or payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A hook event could not be delivered or read.
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// A local resource (PTY, listening port) could not be acquired.
    #[error("resource error: {0}")]
    Resource(String),

    /// The relay rejected the presented token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A pairing URI was malformed.
    #[error("invalid pairing code: {0}")]
    Pairing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

impl BridgeError {
    /// Transport failures are recovered by the relay client's reconnection loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::WebSocket(_))
    }

    /// Resource failures abort session start.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::WebSocket(err) => matches!(
                err.as_ref(),
                tokio_tungstenite::tungstenite::Error::Http(response)
                    if response.status().as_u16() == 401
            ),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
