//! Error taxonomy and empty-body error responses for the proxy

use crate::pool::{empty, ProxyBody};
use hyper::{Response, StatusCode};
use std::path::PathBuf;

/// Errors that stop the application: setup failures and fatal watcher errors.
///
/// Per-request and per-process failures never surface here; they are logged
/// and turned into status codes (see [`ProxyErrorCode`]) or skipped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration could not be read, parsed or validated
    #[error("configuration error: {0}")]
    Config(String),

    /// A target URL or prefix is unusable
    #[error("invalid target {prefix:?} -> {url:?}: {reason}")]
    InvalidTarget {
        prefix: String,
        url: String,
        reason: String,
    },

    /// The listen address could not be parsed
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    /// The proxy could not bind its listen address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A watch path could not be registered at startup
    #[error("cannot watch {path}: {source}")]
    WatchSetup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The OS watch subsystem failed while running
    #[error("error watching file system: {0}")]
    Watch(#[source] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error codes for per-request proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No target prefix matches the request path
    NoTarget,
    /// The backend request failed (unreachable, reset, ...)
    BackendFailed,
    /// The backend response body could not be buffered for rewriting
    ResponseReadFailed,
    /// The live-reload websocket upgrade was rejected
    UpgradeFailed,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoTarget => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendFailed
            | ProxyErrorCode::ResponseReadFailed
            | ProxyErrorCode::UpgradeFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Sentinel-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoTarget => "NO_TARGET",
            ProxyErrorCode::BackendFailed => "BACKEND_FAILED",
            ProxyErrorCode::ResponseReadFailed => "RESPONSE_READ_FAILED",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

/// Header carrying the machine-readable error code
pub const X_SENTINEL_ERROR: &str = "x-sentinel-error";

/// Create an empty-body error response with an X-Sentinel-Error header
pub fn error_response(code: ProxyErrorCode) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header(X_SENTINEL_ERROR, code.as_header_value())
        .body(empty())
        .expect("valid response with StatusCode enum and static headers")
}
