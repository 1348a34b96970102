//! Per-request forwarding logic.
//!
//! Each inbound request is classified (browser vs application), checked
//! against the response cache, deduplicated against identical in-flight
//! GETs, given the right credential material, forwarded to the backend over
//! a pooled connection, and translated back: hop-by-hop headers stripped,
//! cookies re-scoped to the proxy, URLs rewritten, CORS opened for the
//! local origin. Large bodies stream through without buffering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::Semaphore;

use gangway_core::{
    BackendClient, ProxySession, SessionCookie, ACCESS_TOKEN_HEADER, DEVICE_ID_HEADER,
    PROXY_PREFIX,
};

use crate::cache::{self, CacheEntry, CacheManager};
use crate::classify::{classify_user_agent, ClientKind};
use crate::dedup::{Admission, PendingMap, SharedResponse};
use crate::error::Result;
use crate::rewrite::ContentRewriter;
use crate::ws;

/// Boxed body type used for every proxy response.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

/// Responses larger than this are streamed instead of buffered.
pub const STREAMING_THRESHOLD: u64 = 1024 * 1024;

/// Fallback name for the session cookie bridged to the browser, used until
/// the backend's authenticate response supplies its own policy.
pub const SESSION_COOKIE_NAME: &str = "gangway_session";

/// Request headers never forwarded upstream.
const HOP_BY_HOP_REQUEST: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

/// Response headers never forwarded back to the caller.
///
/// `content-length` is framing, not content: the rewriter may change the
/// body size, so the local HTTP stack recomputes it from the actual body
/// (streamed responses fall back to chunked transfer).
const HOP_BY_HOP_RESPONSE: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Upstream connection pool settings, fixed at engine construction.
///
/// `max_total` doubles as the ceiling of the upstream-concurrency semaphore;
/// idle cleanup is handled by the pooled client itself.
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub max_total: usize,
    pub max_per_host: usize,
    pub keep_alive_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_total: 50,
            max_per_host: 30,
            keep_alive_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Engine configuration for one session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend base URL all traffic is forwarded to.
    pub upstream_url: String,
    /// Local proxy origin, e.g. `https://127.0.0.1:61000`.
    pub local_url: String,
    pub pool: ConnectionPoolConfig,
    pub cache_capacity: usize,
}

/// Forwarding counters, all monotonic within one session.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub errors: AtomicU64,
    pub streamed: AtomicU64,
    pub deduplicated: AtomicU64,
    pub websockets: AtomicU64,
}

/// Point-in-time snapshot of [`EngineStats`] for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardingStats {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub streamed: u64,
    pub deduplicated: u64,
    pub websockets: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> ForwardingStats {
        ForwardingStats {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            streamed: self.streamed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            websockets: self.websockets.load(Ordering::Relaxed),
        }
    }
}

/// The per-session forwarding engine.
///
/// Owns the upstream connection pool, the response cache, the rewrite memo,
/// and the pending-request map. One instance exists per running proxy
/// session and is shared across connections behind an `Arc`.
pub struct ForwardingEngine {
    pub(crate) config: EngineConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) session: Arc<ProxySession>,
    pub(crate) backend: BackendClient,
    pub(crate) response_cache: Arc<CacheManager>,
    pub(crate) rewriter: ContentRewriter,
    pub(crate) pending: Arc<PendingMap>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) stats: Arc<EngineStats>,
}

impl ForwardingEngine {
    /// Builds an engine for one session.
    pub fn new(
        config: EngineConfig,
        session: Arc<ProxySession>,
        backend: BackendClient,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.pool.max_per_host)
            .pool_idle_timeout(config.pool.keep_alive_timeout)
            .connect_timeout(config.pool.connect_timeout)
            .timeout(config.pool.request_timeout)
            .build()
            .map_err(|e| {
                crate::error::ProxyError::Config(format!("failed to build upstream client: {e}"))
            })?;

        let response_cache = Arc::new(CacheManager::new(config.cache_capacity));
        let rewrite_memo = Arc::new(CacheManager::new(config.cache_capacity));
        let rewriter = ContentRewriter::new(&config.upstream_url, &config.local_url, rewrite_memo);
        let semaphore = Arc::new(Semaphore::new(config.pool.max_total));

        Ok(Self {
            config,
            client,
            session,
            backend,
            response_cache,
            rewriter,
            pending: Arc::new(PendingMap::new()),
            semaphore,
            stats: Arc::new(EngineStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.response_cache)
    }

    /// Drops all cached responses and rewrite memos.
    pub fn clear_caches(&self) {
        self.response_cache.clear();
    }

    /// Entry point for every inbound request. Never fails: errors become
    /// diagnostic HTTP responses.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote: std::net::SocketAddr,
    ) -> Response<ProxyBody> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        if ws::is_websocket_upgrade(&req) {
            return ws::proxy_upgrade(Arc::clone(&self), req, remote).await;
        }

        self.handle_http(req, remote).await
    }

    async fn handle_http(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote: std::net::SocketAddr,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let path_qs = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let user_agent = req
            .headers()
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let client_kind = classify_user_agent(user_agent.as_deref());

        // Browser cookie bootstrap: navigational GETs without a fresh
        // session cookie get redirected with a newly issued Set-Cookie
        // before any pass-through happens.
        if client_kind == ClientKind::Browser
            && method == hyper::Method::GET
            && is_navigational_root(&path)
            && !self.has_fresh_session_cookie(&req)
        {
            return self.bootstrap_browser(&path_qs).await;
        }

        let key = cache::cache_key(&path, query.as_deref());

        // Cached responses bypass the upstream entirely.
        if method == hyper::Method::GET {
            if let Some(entry) = self.response_cache.get(&key) {
                self.stats.responses.fetch_add(1, Ordering::Relaxed);
                return build_response(entry.status, &entry.headers, entry.body);
            }
        }

        // Deduplication: join an identical in-flight GET if there is one.
        let publisher = if method == hyper::Method::GET {
            match self.pending.admit(&key) {
                Admission::Leader(publisher) => Some(publisher),
                Admission::Waiter(waiter) => {
                    self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                    match waiter.wait().await {
                        Ok(shared) => {
                            // Fresh response object per waiter.
                            self.stats.responses.fetch_add(1, Ordering::Relaxed);
                            return build_response(shared.status, &shared.headers, shared.body);
                        }
                        Err(err) => {
                            // Leader failed; retry with our own upstream call.
                            tracing::debug!(error = %err, "deduplicated leader failed, retrying");
                            None
                        }
                    }
                }
            }
        } else {
            None
        };

        match self
            .forward(req, client_kind, &method, &path, &path_qs, &key, remote, publisher)
            .await
        {
            Ok(response) => response,
            Err(response) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                response
            }
        }
    }

    /// Performs the upstream call and response translation.
    ///
    /// Returns `Err` with a ready diagnostic response for failures, so the
    /// caller can count them.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_kind: ClientKind,
        method: &hyper::Method,
        path: &str,
        path_qs: &str,
        cache_key: &str,
        remote: std::net::SocketAddr,
        publisher: Option<crate::dedup::Publisher>,
    ) -> std::result::Result<Response<ProxyBody>, Response<ProxyBody>> {
        // Backpressure: bounded concurrency for all upstream calls.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| diagnostic(StatusCode::INTERNAL_SERVER_ERROR, "proxy shutting down"))?;

        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| {
                diagnostic(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read request body: {e}"),
                )
            })?;

        let mut upstream_req = self
            .client
            .request(
                method.clone(),
                format!("{}{}{}", self.config.upstream_url, PROXY_PREFIX, path_qs),
            )
            .body(body_bytes.to_vec());

        for (name, value) in filter_request_headers(&parts.headers) {
            upstream_req = upstream_req.header(name, value);
        }
        upstream_req = upstream_req
            .header("X-Real-IP", remote.ip().to_string())
            .header("X-Forwarded-For", remote.ip().to_string())
            .header("X-Forwarded-Proto", "https");

        // Credential injection. Browsers ride on their forwarded cookies;
        // everything else gets the bearer token and device id.
        if client_kind == ClientKind::Application {
            let device_id = self.session.device_id();
            if device_id.is_empty() {
                tracing::error!("device id missing from session, aborting request");
                return Err(diagnostic(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error: device identity unavailable",
                ));
            }
            upstream_req = upstream_req
                .header(ACCESS_TOKEN_HEADER, self.session.access_token())
                .header(DEVICE_ID_HEADER, device_id);
        }

        let upstream_resp = upstream_req.send().await.map_err(|e| {
            if e.is_timeout() {
                diagnostic(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!("backend timed out: {e}"),
                )
            } else {
                diagnostic(
                    StatusCode::BAD_GATEWAY,
                    &format!(
                        "cannot reach backend at {}: {e}\nstart the backend service and retry",
                        self.config.upstream_url
                    ),
                )
            }
        })?;

        let status = upstream_resp.status();

        // An explicit 401 means the credential is stale. Surface it; the
        // session is left alone so the user decides when to re-authenticate.
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("backend rejected credentials with 401");
            return Err(diagnostic(
                StatusCode::UNAUTHORIZED,
                "authentication session expired\nrestart the proxy to re-authenticate",
            ));
        }

        let headers = self.translate_response_headers(upstream_resp.headers());
        let content_type = upstream_resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let content_length = upstream_resp.content_length().unwrap_or(0);

        // Large bodies stream through; they are never rewritten, cached,
        // or shared with deduplicated waiters (those retry on their own).
        if content_length > STREAMING_THRESHOLD {
            self.stats.streamed.fetch_add(1, Ordering::Relaxed);
            self.stats.responses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(path, content_length, "streaming response");
            drop(publisher);

            use futures::TryStreamExt;
            let stream = upstream_resp
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(std::io::Error::other);
            let body = BodyExt::boxed(StreamBody::new(stream));
            return Ok(build_response_with_body(status.as_u16(), &headers, body));
        }

        let mut body_bytes = upstream_resp.bytes().await.map_err(|e| {
            diagnostic(
                StatusCode::BAD_GATEWAY,
                &format!("failed to read backend response: {e}"),
            )
        })?;

        // Rewrite textual content so embedded upstream URLs point here.
        if is_rewritable(&content_type) {
            if let Ok(text) = std::str::from_utf8(&body_bytes) {
                let rewritten = self.rewriter.rewrite(text, &content_type);
                body_bytes = Bytes::from(rewritten);
            }
        }

        // Static assets go to the response cache.
        if *method == hyper::Method::GET && cache::is_cacheable(path, &content_type) {
            self.response_cache.put(
                cache_key.to_string(),
                CacheEntry {
                    body: body_bytes.clone(),
                    headers: headers.clone(),
                    status: status.as_u16(),
                },
            );
            tracing::debug!(path, "cached response");
        }

        if let Some(publisher) = publisher {
            publisher.publish(Ok(SharedResponse {
                status: status.as_u16(),
                headers: headers.clone(),
                body: body_bytes.clone(),
            }));
        }

        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        Ok(build_response(status.as_u16(), &headers, body_bytes))
    }

    /// Translates upstream response headers for the caller: hop-by-hop
    /// headers dropped, cookies re-scoped, CORS opened for the local
    /// origin, redirects pointed back at the proxy.
    fn translate_response_headers(&self, headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(headers.len() + 4);

        for (name, value) in headers {
            let name_lower = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP_RESPONSE.contains(&name_lower.as_str()) {
                continue;
            }
            let Ok(value) = value.to_str() else { continue };

            let translated = match name_lower.as_str() {
                "access-control-allow-origin" => self.config.local_url.clone(),
                "location" => rewrite_location(value, &self.config.upstream_url, &self.config.local_url),
                "set-cookie" => translate_set_cookie(value),
                "content-type" => normalize_content_type(value),
                _ => value.to_string(),
            };
            out.push((name_lower, translated));
        }

        upsert(&mut out, "access-control-allow-origin", &self.config.local_url);
        upsert(&mut out, "access-control-allow-credentials", "true");
        upsert(
            &mut out,
            "access-control-allow-methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        );
        upsert(
            &mut out,
            "access-control-allow-headers",
            "Content-Type, Authorization, X-Requested-With",
        );

        out
    }

    /// True when the browser already carries the cookie issued for the
    /// active session.
    fn has_fresh_session_cookie(&self, req: &Request<Incoming>) -> bool {
        let cookie_name = self
            .session
            .session_cookie()
            .map(|c| c.name)
            .unwrap_or_else(|| SESSION_COOKIE_NAME.to_string());

        let Some(value) = get_cookie(req.headers(), &cookie_name) else {
            return false;
        };
        self.session.cookie_matches(&value)
    }

    /// One-time browser bootstrap: authenticate against the backend, then
    /// redirect the browser back with a fresh session cookie.
    async fn bootstrap_browser(&self, path_qs: &str) -> Response<ProxyBody> {
        tracing::info!(path = path_qs, "bootstrapping browser session cookie");

        let grant = match self.backend.authenticate(&self.session.access_token()).await {
            Ok(grant) => grant,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return diagnostic(
                    StatusCode::BAD_GATEWAY,
                    &format!("backend authentication failed: {e}\nverify the token and that the backend is running"),
                );
            }
        };

        let Some(cookie) = grant.cookie else {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return diagnostic(
                StatusCode::BAD_GATEWAY,
                "backend did not issue a session cookie",
            );
        };

        self.session.set_token_expires_at(grant.expires_at);
        self.session.set_session_cookie(cookie.clone());
        self.stats.responses.fetch_add(1, Ordering::Relaxed);

        Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, path_qs)
            .header(hyper::header::SET_COOKIE, format_session_cookie(&cookie))
            .header(hyper::header::CACHE_CONTROL, "no-store, no-cache, must-revalidate")
            .body(empty_body())
            .unwrap_or_else(|_| diagnostic(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
    }
}

/// Sets a header, replacing any existing value under the same name.
fn upsert(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(n, _)| n == name) {
        Some((_, v)) => *v = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

/// True for paths a browser lands on first, where cookie bootstrap applies.
pub(crate) fn is_navigational_root(path: &str) -> bool {
    let rest = path.strip_prefix(PROXY_PREFIX).unwrap_or(path);
    rest.is_empty() || rest == "/"
}

/// Drops hop-by-hop request headers before forwarding.
fn filter_request_headers(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_REQUEST.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Re-scopes a backend `Set-Cookie` to the local proxy: the `Domain`
/// attribute is dropped, and `Secure` is removed because browsers silently
/// discard Secure cookies served under a self-signed certificate.
pub fn translate_set_cookie(value: &str) -> String {
    value
        .split(';')
        .map(str::trim)
        .filter(|attr| {
            let key = attr.split('=').next().unwrap_or("").to_ascii_lowercase();
            key != "domain" && key != "secure"
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Strips the charset parameter; the rest of the content type passes
/// through untouched.
pub fn normalize_content_type(value: &str) -> String {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.to_ascii_lowercase().starts_with("charset"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Points a backend redirect back at the local proxy.
pub fn rewrite_location(value: &str, upstream_url: &str, local_url: &str) -> String {
    value
        .replace(&format!("{upstream_url}{PROXY_PREFIX}"), local_url)
        .replace(upstream_url, local_url)
}

/// Formats the bridged session cookie: HttpOnly, SameSite=Lax, Path=/,
/// never Secure (self-signed local certificate).
pub fn format_session_cookie(cookie: &SessionCookie) -> String {
    let mut out = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path={}",
        cookie.name, cookie.value, cookie.path
    );
    if let Some(max_age) = cookie.max_age {
        out.push_str(&format!("; Max-Age={max_age}"));
    }
    out
}

/// Extracts one cookie value from a request's `Cookie` header.
pub(crate) fn get_cookie(headers: &hyper::HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(hyper::header::COOKIE)?.to_str().ok()?;
    header.split(';').map(str::trim).find_map(|pair| {
        let (n, v) = pair.split_once('=')?;
        (n == name).then(|| v.to_string())
    })
}

fn is_rewritable(content_type: &str) -> bool {
    content_type.contains("text/")
        || content_type.contains("javascript")
        || content_type.contains("json")
}

/// Wraps bytes in the boxed body type.
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Builds a response from stored parts, used for cache hits and dedup
/// waiters so every caller gets a fresh response object.
pub(crate) fn build_response(
    status: u16,
    headers: &[(String, String)],
    body: Bytes,
) -> Response<ProxyBody> {
    build_response_with_body(status, headers, full_body(body))
}

fn build_response_with_body(
    status: u16,
    headers: &[(String, String)],
    body: ProxyBody,
) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| diagnostic(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

/// Short plain-text diagnostic response.
pub(crate) fn diagnostic(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(Bytes::from(message.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
