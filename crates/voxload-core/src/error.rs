use thiserror::Error;

use crate::session::SessionState;

/// Canonical error type for load-test engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found in the session registry.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"session"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be registered again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"session"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// A session attempted a transition the lifecycle does not allow.
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },

    /// Operation violates current engine state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error occurred while writing reports or reading configuration.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenient result alias for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures on the duplex connection to the system under test.
///
/// These are session-level data: they end one session and are recorded on
/// its record, never propagated past it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint refused the connection.
    #[error("connection refused: {0}")]
    ConnectRefused(String),

    /// The connection attempt failed or timed out.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A frame could not be written.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame could not be read.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote side dropped the connection without a close handshake.
    #[error("connection closed abnormally: {0}")]
    ClosedAbnormally(String),

    /// The remote side sent something that is not a JSON message.
    #[error("protocol error: {0}")]
    Protocol(String),
}
