//! Browser vs application client classification.
//!
//! The engine decides per request which credential scheme to use: browsers
//! carry the session cookie, applications get the bearer token and device id
//! headers injected. Classification is a User-Agent substring heuristic and
//! deliberately fails closed: an unrecognized client cannot be assumed to
//! handle cookies correctly, so it is treated as an application.

/// How a caller is classified for credential routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Browser engine: forward cookies, never inject the bearer header.
    Browser,
    /// Tool, bot, CLI client, or unknown: inject token + device id headers.
    Application,
}

/// User-Agent tokens that mark non-browser clients.
///
/// Checked before the browser list: bot and crawler tokens often appear
/// inside an otherwise browser-looking UA string.
const APPLICATION_SIGNATURES: &[&str] = &[
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "httpie",
    "okhttp",
    "java/",
    "go-http-client",
    "libwww",
    "postman",
    "insomnia",
    "bot",
    "crawler",
    "spider",
];

/// User-Agent tokens that mark browser engines.
const BROWSER_SIGNATURES: &[&str] = &[
    "mozilla",
    "applewebkit",
    "gecko/",
    "chrome/",
    "chromium/",
    "safari/",
    "firefox/",
    "edg/",
    "opr/",
];

/// Classifies a caller from its User-Agent header.
///
/// Absent UA, an application signature, or an unrecognized string all yield
/// [`ClientKind::Application`]; only a known browser-engine signature yields
/// [`ClientKind::Browser`].
pub fn classify_user_agent(user_agent: Option<&str>) -> ClientKind {
    let Some(ua) = user_agent else {
        return ClientKind::Application;
    };

    let ua_lower = ua.to_ascii_lowercase();

    if APPLICATION_SIGNATURES.iter().any(|s| ua_lower.contains(s)) {
        return ClientKind::Application;
    }

    if BROWSER_SIGNATURES.iter().any(|s| ua_lower.contains(s)) {
        return ClientKind::Browser;
    }

    ClientKind::Application
}
