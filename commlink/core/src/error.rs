//! Error Types
//!
//! Every failure in the communication context resolves to exactly one
//! caller-visible [`CommError`]: construction failures are returned from the
//! failing call, connect failures are delivered only to the task awaiting the
//! specific pending operation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, CommError>;

/// Errors raised by the communication context and its engines
#[derive(Debug, Error)]
pub enum CommError {
    /// `init()` was called while a context is already active
    #[error(
        "communication context is already initialized; call reset() before init() to apply new options"
    )]
    AlreadyInitialized,

    /// The context was torn down, or no worker exists yet
    #[error("communication context is not initialized")]
    NotInitialized,

    /// A listener could not bind its port
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        /// Requested port (0 when the engine was asked to choose)
        port: u16,
        /// Underlying engine error
        #[source]
        source: io::Error,
    },

    /// An outbound connect failed (refused, unreachable, timed out)
    #[error("failed to connect to {target}: {reason}")]
    Connect {
        /// `address:port` the operation targeted
        target: String,
        /// Engine-reported reason
        reason: String,
    },

    /// A pending connect was cancelled before it completed
    #[error("connect to {target} was cancelled")]
    Cancelled {
        /// `address:port` the operation targeted
        target: String,
    },

    /// An option value was rejected by the engine
    #[error("invalid value {value:?} for option {key}: {reason}")]
    InvalidOption {
        /// Option name
        key: String,
        /// Rejected value
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// An option file could not be read or parsed
    #[error("failed to load options from {path:?}: {reason}")]
    OptionsFile {
        /// File that failed to load
        path: PathBuf,
        /// Read or parse failure
        reason: String,
    },

    /// I/O attempted on a closed endpoint
    #[error("endpoint {0} is closed")]
    EndpointClosed(String),

    /// Endpoint I/O failure reported by the engine
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CommError {
    /// Build a connect error from any displayable reason
    pub(crate) fn connect(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an invalid option error
    pub(crate) fn invalid_option(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from a failed outbound connect
    #[must_use]
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    /// Whether this error reports a cancelled operation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
