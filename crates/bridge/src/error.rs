//! Error types for the MCP bridge.

use thiserror::Error;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (bad path, malformed JSON, schema violations)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-cycle errors (one upstream failed to connect, reconnect, or
    /// was closed by the peer)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A call was routed to an upstream that is not currently connected
    #[error("Upstream \"{0}\" is not connected")]
    NotConnected(String),

    /// The namespaced name does not resolve to a configured upstream
    #[error("Unknown upstream \"{0}\"")]
    UnknownUpstream(String),

    /// A tool name could not be parsed or is not registered
    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    /// The policy engine denied the call
    #[error("Policy error: {0}")]
    Policy(String),

    /// Error reported by an upstream while serving a call, tagged with the
    /// owning source for diagnosability
    #[error("Upstream server \"{name}\" error: {message}")]
    Upstream { name: String, message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
