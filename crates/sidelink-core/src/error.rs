// Sidelink Error Types
use std::time::Duration;

use thiserror::Error;

use sidelink_types::ConnectionType;
use sidelink_wire::WireError;

use crate::cache::StorageKey;

#[derive(Error, Debug)]
pub enum SidelinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Message unsent: socket not open")]
    NotConnected,

    #[error("Originator mismatch: expected {expected}, found {found}")]
    OriginatorMismatch { expected: String, found: String },

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Sidecar refused access")]
    Unauthorized,

    #[error("Socket closed before the handshake completed")]
    HandshakeAborted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unhandled connection type {0}")]
    UnhandledConnectionType(ConnectionType),

    #[error("Foreign key mismatch in {key}: expected {expected}, found {found}")]
    ForeignKeyMismatch {
        key: StorageKey,
        expected: String,
        found: String,
    },

    #[error("No mutex provisioned for storage key {0}")]
    MissingMutex(StorageKey),

    #[error("Cloud connection reconciliation failed: {0}")]
    Reconcile(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SidelinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SidelinkError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SidelinkError>;
