use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The primary error type for the `nesys-lib` library.
#[derive(Error, Debug)]
pub enum NesysError {
    #[error("Network failure: {0}")]
    NetworkFailure(#[source] io::Error),

    #[error("Timed out waiting for the profile server")]
    TimedOut,

    #[error("Server response failed authentication")]
    AuthRejectedByServer,

    #[error("Server could not authenticate the request")]
    AuthRejectedByClient,

    #[error("Malformed header: expected {expected} bytes, got {actual}")]
    MalformedHeader { expected: usize, actual: usize },

    #[error("Invalid profile id format: {0:?}")]
    InvalidIdFormat(String),

    #[error("Protocol error: unexpected message id {0:#06x}")]
    ProtocolError(u16),

    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Field `{field}` is {len} bytes, limit is {max}")]
    FieldTooLong { field: &'static str, len: usize, max: usize },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Settings error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Process access failed: {0}")]
    ProcessAccess(String),
}

/// How the worker reacts to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient network condition, retry after a short delay
    Retry,
    /// Authentication broke down, the worker must stop
    Fatal,
    /// Report through the status text and keep polling
    Degrade,
}

impl NesysError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            NesysError::NetworkFailure(_) | NesysError::TimedOut => ErrorClass::Retry,
            NesysError::AuthRejectedByServer | NesysError::AuthRejectedByClient => ErrorClass::Fatal,
            _ => ErrorClass::Degrade,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Fatal
    }

    /// Short text for the controller's status line
    pub fn status_text(&self) -> &'static str {
        match self {
            NesysError::NetworkFailure(_) => "Network failure!",
            NesysError::TimedOut => "The server took too long to respond!",
            NesysError::AuthRejectedByClient => "The server could not authenticate the request!",
            NesysError::AuthRejectedByServer => {
                "Server failed to authenticate a request. Set the key in the config file."
            }
            NesysError::InvalidIdFormat(_) => "The server sent a malformed profile id!",
            NesysError::Io { .. } => "Unable to access a removable drive!",
            NesysError::ProcessAccess(_) => "Can't access process memory. (Maybe permissions?)",
            _ => "Unknown error when connecting to server!",
        }
    }
}

/// Map a socket error onto the protocol's failure taxonomy.
pub(crate) fn classify_io(err: io::Error) -> NesysError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NesysError::TimedOut,
        _ => NesysError::NetworkFailure(err),
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: io::Error) -> NesysError {
    NesysError::Io {
        path: path.into(),
        source,
    }
}

impl From<tokio::time::error::Elapsed> for NesysError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NesysError::TimedOut
    }
}
