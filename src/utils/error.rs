//! The `error` module defines the error types used across `mqtt-relay`.
//!
//! Synchronous failures surface to the immediate caller as a [`RelayError`].
//! Transport and storage causes are wrapped in their own enums so callers can
//! tell a broker problem from a backend problem without string matching.
//! Webhook delivery failures never reach this type: they are terminal, logged
//! by the dispatcher and never escalated.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Crate-wide error returned by supervisor, store and registry operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid or missing broker/webhook configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connect, publish or subscribe failure at the MQTT transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An outbox record or webhook id does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input (webhook definition, topic filter, qos value).
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend failure underneath the outbox/webhook store.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A caller-supplied deadline elapsed before the operation finished.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Response class the HTTP layer maps an error onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadInput,
    NotFound,
    Upstream,
}

impl RelayError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RelayError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Validation(_) | RelayError::Configuration(_) => ErrorClass::BadInput,
            RelayError::NotFound { .. } => ErrorClass::NotFound,
            RelayError::Transport(_)
            | RelayError::Storage(_)
            | RelayError::DeadlineExceeded(_) => ErrorClass::Upstream,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound { .. })
    }
}

/// Failures of the MQTT transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client is not connected")]
    NotConnected,

    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("broker rejected connection: {0}")]
    Rejected(String),

    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("transport event loop stopped")]
    Closed,
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Storage(StorageError::Sqlite(err))
    }
}

impl From<sled::Error> for RelayError {
    fn from(err: sled::Error) -> Self {
        RelayError::Storage(StorageError::Sled(err))
    }
}

/// Failures of a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection lock poisoned")]
    Poisoned,

    /// The caller stopped waiting before the call reached the database.
    #[error("call abandoned before it ran")]
    Abandoned,
}
