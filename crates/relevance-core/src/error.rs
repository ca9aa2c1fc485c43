//! Error types for relevance model synchronization

use thiserror::Error;

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Connection and initialization errors
    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Coordination session closed")]
    SessionClosed,

    #[error("{component} has not been initialized")]
    NotInitialized { component: String },

    #[error("Message dispatcher has been shut down")]
    DispatcherShutdown,

    // Coordination errors
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    #[error("Coordination error: {message}")]
    Coordination { message: String },

    #[error("Failed to send out message: {message}")]
    Dispatch { message: String },

    // Decode and compile errors
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Can not build model {name}: {reason}")]
    ModelBuild { name: String, reason: String },

    #[error("Invalid model name {name:?}: {reason}")]
    InvalidModelName { name: String, reason: String },

    // Protocol errors
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Unknown message type: {msg_type}")]
    UnknownMessageType { msg_type: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if retrying the whole logical operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss
                | Error::Coordination { .. }
                | Error::Dispatch { .. }
                | Error::BadVersion { .. }
        )
    }

    /// Returns true if the error came from talking to the coordination service
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLoss
                | Error::SessionClosed
                | Error::NodeExists { .. }
                | Error::NoNode { .. }
                | Error::BadVersion { .. }
                | Error::NotEmpty { .. }
                | Error::Coordination { .. }
                | Error::Dispatch { .. }
        )
    }

    /// Returns true if the caller supplied something unusable
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::ModelBuild { .. } | Error::InvalidModelName { .. } | Error::InvalidMessage { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
