//! In-memory credential state for one running proxy instance.
//!
//! A session is created at proxy start and purged at stop. Nothing here is
//! ever persisted to disk.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// The session cookie last issued to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<i64>,
    pub path: String,
}

/// In-memory credential state: token, device id, and cookie material.
///
/// Fields are written only during start/stop transitions; request handling
/// reads them through shared references. `purge` must run on every stop
/// path, including failed logouts.
#[derive(Debug)]
pub struct ProxySession {
    access_token: RwLock<String>,
    backend_url: RwLock<String>,
    device_id: RwLock<String>,
    token_expires_at: RwLock<Option<DateTime<Utc>>>,
    session_cookie: RwLock<Option<SessionCookie>>,
}

impl ProxySession {
    /// Creates a session for one start/stop cycle.
    pub fn new(access_token: String, backend_url: String, device_id: String) -> Self {
        Self {
            access_token: RwLock::new(access_token),
            backend_url: RwLock::new(backend_url),
            device_id: RwLock::new(device_id),
            token_expires_at: RwLock::new(None),
            session_cookie: RwLock::new(None),
        }
    }

    pub fn access_token(&self) -> String {
        self.access_token.read().clone()
    }

    pub fn backend_url(&self) -> String {
        self.backend_url.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.device_id.read().clone()
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        *self.token_expires_at.read()
    }

    pub fn set_token_expires_at(&self, expires_at: Option<DateTime<Utc>>) {
        *self.token_expires_at.write() = expires_at;
    }

    /// Records the cookie issued to the browser during bootstrap.
    pub fn set_session_cookie(&self, cookie: SessionCookie) {
        *self.session_cookie.write() = Some(cookie);
    }

    pub fn session_cookie(&self) -> Option<SessionCookie> {
        self.session_cookie.read().clone()
    }

    /// Returns true if the given cookie value matches the one issued for
    /// the active session.
    pub fn cookie_matches(&self, value: &str) -> bool {
        self.session_cookie
            .read()
            .as_ref()
            .is_some_and(|c| c.value == value)
    }

    /// Clears all credential material from memory.
    ///
    /// Infallible: stop paths call this unconditionally, even when the
    /// network logout failed.
    pub fn purge(&self) {
        self.access_token.write().clear();
        self.backend_url.write().clear();
        self.device_id.write().clear();
        *self.token_expires_at.write() = None;
        *self.session_cookie.write() = None;
    }

    /// Returns true once `purge` has run.
    pub fn is_purged(&self) -> bool {
        self.access_token.read().is_empty() && self.device_id.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> ProxySession {
        ProxySession::new(
            "tok-123".to_string(),
            "https://backend.example".to_string(),
            "aabbccddeeff00112233".to_string(),
        )
    }

    #[test]
    fn session_exposes_fields() {
        let s = test_session();
        assert_eq!(s.access_token(), "tok-123");
        assert_eq!(s.backend_url(), "https://backend.example");
        assert_eq!(s.device_id(), "aabbccddeeff00112233");
        assert!(s.token_expires_at().is_none());
    }

    #[test]
    fn purge_clears_everything() {
        let s = test_session();
        s.set_session_cookie(SessionCookie {
            name: "gangway_session".to_string(),
            value: "v1".to_string(),
            max_age: Some(3600),
            path: "/".to_string(),
        });
        s.purge();
        assert!(s.is_purged());
        assert!(s.session_cookie().is_none());
        assert_eq!(s.backend_url(), "");
    }

    #[test]
    fn cookie_matches_issued_value() {
        let s = test_session();
        assert!(!s.cookie_matches("v1"));
        s.set_session_cookie(SessionCookie {
            name: "gangway_session".to_string(),
            value: "v1".to_string(),
            max_age: None,
            path: "/".to_string(),
        });
        assert!(s.cookie_matches("v1"));
        assert!(!s.cookie_matches("stale"));
    }
}
