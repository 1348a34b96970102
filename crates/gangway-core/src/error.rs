//! Error types for core operations.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or invalid configuration (token, URL).
    #[error("configuration error: {0}")]
    Config(String),

    /// Token rejected by the backend.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Backend could not be reached.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Backend returned a response we could not parse.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    /// Device identifier could not be derived.
    #[error("failed to derive device id: {0}")]
    DeviceId(String),

    /// HTTP transport error.
    #[error("request error: {0}")]
    Request(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
