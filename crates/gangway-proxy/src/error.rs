//! Error types for the proxy.

use thiserror::Error;

use gangway_core::CoreError;

/// Proxy error type.
///
/// Only start-time failures are fatal to a session; per-request errors are
/// translated into HTTP diagnostics and never take the listener down.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing token/URL/device-id. Fatal, no retry.
    #[error("configuration error: {0}")]
    Config(String),

    /// The listening port is held by another process.
    #[error("port {port} is in use{}", holder_suffix(.holder))]
    PortConflict {
        port: u16,
        /// (pid, process name) of the holder, when attribution is known.
        holder: Option<(u32, String)>,
    },

    /// Invalid or expired token. Surfaced, not retried automatically.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Backend connection or timeout failure.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Malformed upstream response.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

fn holder_suffix(holder: &Option<(u32, String)>) -> String {
    match holder {
        Some((pid, name)) => format!(" by {name} (pid {pid})"),
        None => String::new(),
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
