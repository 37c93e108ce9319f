use std::path::PathBuf;

use thiserror::Error;

/// rootpull error types
#[derive(Error, Debug)]
pub enum PullError {
    /// Malformed image reference
    #[error("invalid image reference: {0}")]
    Parse(String),

    /// No provider supports the URL, or an auth resource is unreadable
    #[error("provider error: {0}")]
    Provider(String),

    /// The registry does not speak the v2 manifest protocol
    #[error("no schema version 2 support by {url}")]
    UnsupportedRegistry { url: String },

    /// An HTTP request failed at the transport level or with a non-2xx status
    #[error("{method} {url} failed{}", .status.map(|s| format!(" with {s}")).unwrap_or_default())]
    Network {
        method: String,
        url: String,
        status: Option<u16>,
    },

    /// A response body was present but could not be parsed
    #[error("error parsing {what}: {message}")]
    Decode { what: String, message: String },

    /// The bound platform has no matching manifest
    #[error("{0}")]
    PlatformNotFound(String),

    /// The manifest lists no layers to extract
    #[error("no layers found for {0}")]
    NoLayers(String),

    /// A tar entry name attempts to escape the destination
    #[error("refusing to extract unsafe path: {0}")]
    UnsafePath(String),

    /// The destination directory already has contents
    #[error("directory {0} is not empty")]
    DestinationNotEmpty(PathBuf),

    /// A filesystem operation failed
    #[error("error during {op} on {path}: {source}")]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Cancellation was observed mid-operation
    #[error("interrupted")]
    Interrupted,

    /// I/O error without a more specific context
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PullError {
    /// Shorthand for a `Filesystem` error wrapping an `std::io::Error`.
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PullError::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for rootpull operations
pub type Result<T> = std::result::Result<T, PullError>;
