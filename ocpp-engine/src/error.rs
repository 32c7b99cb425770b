//! Error types shared by every layer of the engine

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::messages::{DecodeError, ErrorCode};

/// Errors in OCPP session handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No handler registered for the inbound action
    #[error("action not implemented: {0}")]
    NotImplemented(String),

    /// Handler chose to answer with a specific CALLERROR
    #[error("handler failed: {code} - {description}")]
    Handler { code: ErrorCode, description: String },

    /// Peer answered our CALL with a CALLERROR
    #[error("OCPP error from peer: {code} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call cancelled: {0}")]
    Cancelled(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("subprotocol mismatch: requested {requested:?}, supported {supported:?}")]
    SubprotocolMismatch {
        requested: Option<String>,
        supported: Vec<String>,
    },

    #[error("charge point not connected: {0}")]
    NotFound(String),

    #[error("charge point {0} already connected")]
    IdentityConflict(String),

    #[error("invalid charge point identity in path {0:?}")]
    InvalidIdentity(String),

    #[error("message id {0} already outstanding")]
    DuplicateMessageId(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcppError {
    /// Build the error a handler returns to answer with a specific CALLERROR.
    pub fn handler(code: ErrorCode, description: impl Into<String>) -> Self {
        OcppError::Handler {
            code,
            description: description.into(),
        }
    }

    /// True for the outcomes that mean the session is gone, not that one call failed.
    pub fn is_closed(&self) -> bool {
        matches!(self, OcppError::ConnectionClosed | OcppError::Cancelled(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for OcppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => OcppError::ConnectionClosed,
            WsError::Io(e) => OcppError::Io(e),
            other => OcppError::Transport(other.to_string()),
        }
    }
}
