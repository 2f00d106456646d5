//! Error types for the aduro-stove crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A single read or write against the stove failed.
    #[error("Transport error: {context}")]
    Transport {
        /// Description of what failed.
        context: String,
    },

    /// The stove answered a write with a non-empty body.
    #[error("Command rejected: {path} -> {response}")]
    CommandRejected {
        /// The setting path that was written.
        path: String,
        /// The response body returned by the stove.
        response: String,
    },

    /// Network discovery failed.
    #[error("Discovery failed: {reason}")]
    Discovery {
        /// Description of why discovery failed.
        reason: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// A reply frame from the stove could not be parsed.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// Loading or saving persisted state failed.
    #[error("Persistence error: {context}")]
    Persistence {
        /// Description of the failure.
        context: String,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No telemetry has been received yet.
    #[error("No telemetry available")]
    NoTelemetry,

    /// Every fetch of a poll cycle failed.
    #[error("Poll failed: {reason}")]
    PollFailed {
        /// Description of why the cycle failed.
        reason: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidParameter`].
    pub(crate) fn invalid_parameter(name: &str, value: impl ToString) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Whether the error came from talking to the stove.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::CommandRejected { .. } | Self::Discovery { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
