//! URL rewriting for proxied content.
//!
//! HTML, CSS, and other textual responses from the upstream embed absolute
//! URLs pointing at the upstream host. Browsers talking to the local proxy
//! must never follow those, so every variant - full origin, protocol-relative
//! host, WebSocket scheme, and root-relative attribute/url() paths - is
//! rewritten to the local origin, with any forwarding prefix removed along
//! the way. Rewriting is pure string work, isolated from I/O, and memoized
//! through a dedicated cache.

use std::sync::Arc;

use hyper::body::Bytes;
use parking_lot::RwLock;
use regex::Regex;
use sha2::{Digest, Sha256};

use gangway_core::PROXY_PREFIX;

use crate::cache::{CacheEntry, CacheManager};

/// Inputs below this size are fingerprinted by full content hash.
const FULL_HASH_THRESHOLD: usize = 10 * 1024;

/// Rewritten outputs at or above this size are not memoized.
const MEMO_SIZE_LIMIT: usize = 100 * 1024;

#[derive(Debug, Clone)]
struct UrlPair {
    upstream_url: String,
    local_url: String,
    upstream_host: String,
    local_host: String,
}

/// Rewrites upstream URLs in textual content to point at the local proxy.
#[derive(Debug)]
pub struct ContentRewriter {
    urls: RwLock<UrlPair>,
    memo: Arc<CacheManager>,
    html_attr: Regex,
    css_url: Regex,
}

impl ContentRewriter {
    /// Creates a rewriter mapping `upstream_url` to `local_url`, memoizing
    /// results in the given cache. The cache must not be shared with the
    /// response cache.
    pub fn new(upstream_url: &str, local_url: &str, memo: Arc<CacheManager>) -> Self {
        Self {
            urls: RwLock::new(UrlPair::derive(upstream_url, local_url)),
            memo,
            html_attr: Regex::new(r#"(href|src|action)=["'](/[^"']*)["']"#)
                .expect("valid html attribute pattern"),
            css_url: Regex::new(r#"url\(["']?(/[^)"']*)["']?\)"#).expect("valid css url pattern"),
        }
    }

    /// Updates the URL pair for a new session.
    pub fn set_urls(&self, upstream_url: &str, local_url: &str) {
        *self.urls.write() = UrlPair::derive(upstream_url, local_url);
        tracing::info!(upstream = upstream_url, local = local_url, "rewriter URLs updated");
    }

    /// Rewrites upstream URLs in `content` to the local origin.
    ///
    /// Idempotent: content already pointing at the local origin passes
    /// through unchanged.
    pub fn rewrite(&self, content: &str, content_type: &str) -> String {
        let fingerprint = self.fingerprint(content, content_type);
        if let Some(cached) = self.memo.get(&fingerprint) {
            return String::from_utf8_lossy(&cached.body).into_owned();
        }

        let urls = self.urls.read().clone();
        let local_ws = format!("wss://{}", urls.local_host);

        // Literal replacements first. For each form the prefixed variant
        // goes before the plain one, so upstream URLs already carrying the
        // forwarding prefix lose it: the engine re-adds the prefix on the
        // way back out, and keeping it here would double it. WebSocket
        // schemes go before the protocol-relative form so ws:// URLs land
        // on wss:// + local host: the local listener only speaks TLS.
        let mut out = content.replace(
            &format!("{}{}", urls.upstream_url, PROXY_PREFIX),
            &urls.local_url,
        );
        out = out.replace(&urls.upstream_url, &urls.local_url);
        out = out.replace(
            &format!("wss://{}{}", urls.upstream_host, PROXY_PREFIX),
            &local_ws,
        );
        out = out.replace(&format!("wss://{}", urls.upstream_host), &local_ws);
        out = out.replace(
            &format!("ws://{}{}", urls.upstream_host, PROXY_PREFIX),
            &local_ws,
        );
        out = out.replace(&format!("ws://{}", urls.upstream_host), &local_ws);
        out = out.replace(
            &format!("//{}{}", urls.upstream_host, PROXY_PREFIX),
            &format!("//{}", urls.local_host),
        );
        out = out.replace(
            &format!("//{}", urls.upstream_host),
            &format!("//{}", urls.local_host),
        );

        if content_type.contains("text/html") {
            out = self
                .html_attr
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    let path = strip_forward_prefix(&caps[2]);
                    format!("{}=\"{}{}\"", &caps[1], urls.local_url, path)
                })
                .into_owned();
        } else if content_type.contains("text/css") {
            out = self
                .css_url
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    format!("url({}{})", urls.local_url, strip_forward_prefix(&caps[1]))
                })
                .into_owned();
        }

        if out.len() < MEMO_SIZE_LIMIT {
            self.memo.put(
                fingerprint,
                CacheEntry {
                    body: Bytes::from(out.clone()),
                    headers: Vec::new(),
                    status: 200,
                },
            );
        }

        out
    }

    /// Fingerprints (content, content_type) for memo lookup.
    ///
    /// Small inputs get a full content hash. Larger inputs hash the first
    /// 1KiB plus the length: an accepted collision tradeoff - rewriting is
    /// idempotent, so a false hit serves a variant rewrite at worst, and
    /// full hashing would cost exactly what the memoization saves.
    fn fingerprint(&self, content: &str, content_type: &str) -> String {
        let mut hasher = Sha256::new();
        if content.len() < FULL_HASH_THRESHOLD {
            hasher.update(content.as_bytes());
        } else {
            let prefix_end = content
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= 1024)
                .last()
                .unwrap_or(0);
            hasher.update(&content.as_bytes()[..prefix_end]);
            hasher.update(content.len().to_le_bytes());
        }
        hasher.update(content_type.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl UrlPair {
    fn derive(upstream_url: &str, local_url: &str) -> Self {
        Self {
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            local_url: local_url.trim_end_matches('/').to_string(),
            upstream_host: strip_scheme(upstream_url).to_string(),
            local_host: strip_scheme(local_url).to_string(),
        }
    }
}

fn strip_scheme(url: &str) -> &str {
    url.trim_end_matches('/')
        .trim_start_matches("https://")
        .trim_start_matches("http://")
}

/// Removes a leading forwarding prefix from a root-relative path. Only a
/// whole path segment counts: `/api/v1/proxying` is somebody else's path.
fn strip_forward_prefix(path: &str) -> &str {
    match path.strip_prefix(PROXY_PREFIX) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest,
        _ => path,
    }
}
