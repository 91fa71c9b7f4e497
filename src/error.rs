//! Error types for the Millennium core.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Millennium core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket connect/read/write failures; recoverable by the caller's
    /// reconnect policy
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected DevTools-protocol traffic; the frame is
    /// dropped, the connection stays open
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// RPC function, debugger target, or plugin not found. Carries the
    /// full message; it travels verbatim as an IPC failure reply.
    #[error("{0}")]
    NotFound(String),

    /// A registered RPC handler does not have the shape the caller expects
    #[error("Invalid function type: {0}")]
    TypeMismatch(String),

    /// Plugin manifest or lifecycle errors
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] Box<reqwest::Error>),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Regex compilation errors (hook URL patterns)
    #[error("Pattern error: {0}")]
    Pattern(#[from] Box<regex::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a type-mismatch error.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch(message.into())
    }

    /// Create a plugin error.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(Box::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Self::Pattern(Box::new(value))
    }
}
