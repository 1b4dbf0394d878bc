//! Centralized error types for graphmail.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the graphmail library.
#[derive(Error, Debug)]
pub enum GraphMailError {
    /// A required setting is missing or an enumerated option is invalid.
    #[error("{0}")]
    Config(String),

    /// No cached account, or the silent token refresh failed.
    #[error("{0}")]
    Auth(String),

    /// The Graph API answered with a non-success status or unusable content.
    ///
    /// `status` is `None` when the request never produced a response.
    #[error("{message}")]
    Api { status: Option<u16>, message: String },

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The stream state document exists but cannot be parsed.
    #[error("Invalid JSON in state file '{path}': {reason}")]
    InvalidState { path: PathBuf, reason: String },

    /// A flag combination or limit was rejected before any side effect.
    #[error("{0}")]
    InvalidArgument(String),

    /// A folder selector could not be resolved to a single folder.
    #[error("{0}")]
    Folder(String),
}

/// Convenience alias for `Result<T, GraphMailError>`.
pub type Result<T> = std::result::Result<T, GraphMailError>;

impl GraphMailError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an `Api` variant.
    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Stable name of the error kind, used in the structured error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Auth(_) => "AuthError",
            Self::Api { .. } => "GraphAPIError",
            Self::Io { .. } => "IoError",
            Self::InvalidState { .. } => "StateError",
            Self::InvalidArgument(_) => "ValueError",
            Self::Folder(_) => "FolderError",
        }
    }

    /// HTTP status carried by an `Api` error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `GraphMailError::io`).
impl From<std::io::Error> for GraphMailError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
