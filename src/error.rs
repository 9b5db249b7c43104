//! Error types and exit codes for sockrelay

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

/// Main error type for server and client operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid bind target: {message}")]
    InvalidTarget { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to read config file {path}: {message}")]
    ConfigRead { path: PathBuf, message: String },

    #[error("Server closed the connection without a response")]
    NoResponse,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Convert error to an exit code:
    /// - 1: IO error / missing response
    /// - 2: Invalid configuration or bind target
    /// - 3: Bind failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) | Self::NoResponse => ExitCode::from(1),
            Self::InvalidTarget { .. } | Self::Config { .. } | Self::ConfigRead { .. } => {
                ExitCode::from(2)
            }
            Self::Bind { .. } => ExitCode::from(3),
        }
    }
}

/// Result type alias for sockrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure of a single session, or of the accept loop when no session exists yet.
///
/// None of these are fatal to the server; they are funneled to the registry
/// as error events and logged there.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("client disconnected before sending a request header")]
    HeaderMissing,

    #[error("request header was not terminated by a newline")]
    HeaderUnterminated,

    #[error("failed to read request: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write response: {0}")]
    Write(#[source] std::io::Error),

    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),

    #[error("request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("computation did not complete: {0}")]
    Computation(String),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}
