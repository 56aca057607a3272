use thiserror::Error;

/// Recoverable outcome of a builder, correlator or pipeline call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Failed to send request")]
    SendFailed,

    /// The request may still have completed on the agent.
    #[error("Operation timed out (outcome unknown)")]
    TimedOut,

    #[error("Disconnected")]
    Disconnected,

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Server(String),

    #[error("Request id already pending: {0}")]
    DuplicateRequest(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("File manager is not running")]
    Closed,
}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        OperationError::Io(e.to_string())
    }
}

/// Failure reported by a [`crate::transport::Transport`] send or start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("tunnel is not ready for data")]
    NotReady,

    #[error("outbound queue is full")]
    Backpressure,

    #[error("tunnel closed")]
    Closed,

    #[error("transport I/O: {0}")]
    Io(String),
}

impl From<TransportError> for OperationError {
    fn from(e: TransportError) -> Self {
        OperationError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;
