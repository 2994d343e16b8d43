//! Common error types for babylink.

use thiserror::Error;

/// Result type alias using babylink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for babylink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Service discovery backend failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Socket connect, read or write failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The media engine rejected a negotiation step
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Protocol error (out-of-order or unexpected message)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// The channel or connection is already closed
    #[error("closed: {0}")]
    Closed(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a discovery error from any displayable type.
    pub fn discovery(msg: impl std::fmt::Display) -> Self {
        Self::Discovery(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a closed error from any displayable type.
    pub fn closed(msg: impl std::fmt::Display) -> Self {
        Self::Closed(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::config(err)
    }
}
