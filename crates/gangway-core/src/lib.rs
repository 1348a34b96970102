//! Gangway core - device identity, session state, and backend API client.
//!
//! This crate holds everything the proxy needs to know about *who* it is
//! running for: the stable device identifier, the in-memory credential
//! session, and the client for the backend's control endpoints
//! (authenticate, status, logout, health). No forwarding logic lives here.

mod backend;
mod device;
mod error;
mod session;

pub use backend::{
    parse_set_cookie, AuthGrant, BackendClient, HealthReport, HealthStatus, TokenStatus,
    ACCESS_TOKEN_HEADER, DEVICE_ID_HEADER, PROXY_PREFIX,
};
pub use device::{device_id, validate_device_id, DEVICE_ID_LEN};
pub use error::{CoreError, Result};
pub use session::{ProxySession, SessionCookie};
