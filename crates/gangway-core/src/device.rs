//! Stable device identifier derivation.
//!
//! The device id binds one access token to one machine on the backend.
//! It is a hash of host characteristics, so it stays the same across app
//! restarts on the same computer but differs between computers.

use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Length of the derived device id in hex characters.
pub const DEVICE_ID_LEN: usize = 20;

/// Derives a stable device identifier from host characteristics.
///
/// The id is the first 20 hex characters of a SHA-256 over the hostname,
/// OS name, and CPU architecture. Absence of all components is an error:
/// a proxy session must never run without a device identity.
///
/// # Examples
///
/// ```
/// let id = gangway_core::device_id().unwrap();
/// assert_eq!(id.len(), 20);
/// ```
pub fn device_id() -> Result<String> {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    let components = [host.as_str(), std::env::consts::OS, std::env::consts::ARCH];
    let fingerprint = components
        .iter()
        .filter(|c| !c.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-");

    if fingerprint.is_empty() {
        return Err(CoreError::DeviceId(
            "no host characteristics available".to_string(),
        ));
    }

    let digest = Sha256::digest(fingerprint.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    Ok(hex[..DEVICE_ID_LEN].to_string())
}

/// Validates a device id: non-empty, between 8 and 255 characters.
pub fn validate_device_id(device_id: &str) -> bool {
    (8..=255).contains(&device_id.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable() {
        let a = device_id().unwrap();
        let b = device_id().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn device_id_has_expected_length() {
        let id = device_id().unwrap();
        assert_eq!(id.len(), DEVICE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn validate_rejects_empty() {
        assert!(!validate_device_id(""));
    }

    #[test]
    fn validate_rejects_too_short() {
        assert!(!validate_device_id("abc"));
    }

    #[test]
    fn validate_rejects_too_long() {
        assert!(!validate_device_id(&"a".repeat(256)));
    }

    #[test]
    fn validate_accepts_derived_id() {
        assert!(validate_device_id(&device_id().unwrap()));
    }
}
