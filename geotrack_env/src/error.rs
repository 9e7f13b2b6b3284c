//! Error types for the GeoTrack environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The transport could not establish a connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// An established connection was lost (EOF, reset, forced drop).
    #[error("Connection lost: {0}")]
    Disconnected(String),

    /// The peer violated the framing protocol or sent an ERROR frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Underlying socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a disconnect error.
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns true if the error ends the current connection epoch.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Io(_) | Self::Protocol(_))
    }
}
