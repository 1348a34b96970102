//! Proxy lifecycle management.
//!
//! The manager owns the state machine around one proxy session: validate,
//! resolve port conflicts, bind the TLS listener, authenticate against the
//! backend, run, and on stop tear everything down and purge credentials.
//! A background task probes backend health on a fixed interval regardless
//! of whether the proxy is running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use gangway_core::{device_id, validate_device_id, BackendClient, HealthReport, ProxySession, TokenStatus};

use crate::cache::{CacheStats, DEFAULT_CACHE_CAPACITY};
use crate::engine::{ConnectionPoolConfig, EngineConfig, ForwardingEngine, ForwardingStats};
use crate::error::{ProxyError, Result};
use crate::listener;
use crate::ports::{PortInspector, PortStatus, SocketProbe};

/// Default local port the proxy listens on.
pub const DEFAULT_PROXY_PORT: u16 = 61000;

/// How long stop waits for the listener task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait after terminating a stale instance before re-probing the port.
const PORT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle states of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Starting,
    Authenticating,
    Running,
    Stopping,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Authenticating => "authenticating",
            ProxyState::Running => "running",
            ProxyState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Manager configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cache_capacity: usize,
    pub pool: ConnectionPoolConfig,
    pub health_interval: Duration,
}

impl ManagerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            pool: ConnectionPoolConfig::default(),
            health_interval: Duration::from_secs(60),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Everything owned by one running session.
struct RunningProxy {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    engine: Arc<ForwardingEngine>,
    session: Arc<ProxySession>,
    backend: BackendClient,
}

/// Status report for callers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub state: ProxyState,
    pub running: bool,
    pub port: u16,
    /// Set when the proxy is stopped and something else holds its port.
    pub port_diagnostics: Option<String>,
    pub backend_url: Option<String>,
    pub stats: Option<ForwardingStats>,
    pub cache: Option<CacheStats>,
    pub health: Option<HealthReport>,
}

/// Owns the proxy lifecycle. One instance per application.
pub struct ProxyManager {
    config: ManagerConfig,
    inspector: Arc<dyn PortInspector>,
    state: Mutex<ProxyState>,
    running: Mutex<Option<RunningProxy>>,
    health_backend: Arc<RwLock<Option<BackendClient>>>,
    last_health: Arc<RwLock<Option<HealthReport>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyManager {
    pub fn new(config: ManagerConfig, inspector: Arc<dyn PortInspector>) -> Self {
        Self {
            config,
            inspector,
            state: Mutex::new(ProxyState::Stopped),
            running: Mutex::new(None),
            health_backend: Arc::new(RwLock::new(None)),
            last_health: Arc::new(RwLock::new(None)),
            health_task: Mutex::new(None),
        }
    }

    /// Manager with the default bind-probe port inspector.
    pub fn with_defaults(config: ManagerConfig) -> Self {
        Self::new(config, Arc::new(SocketProbe))
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    /// Starts the proxy: validates inputs, resolves the port, binds the
    /// TLS listener, then authenticates before declaring itself running.
    pub async fn start(&self, backend_url: &str, token: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ProxyState::Stopped {
                return Err(ProxyError::Config(format!(
                    "cannot start while {state}"
                )));
            }
            *state = ProxyState::Starting;
        }

        match self.start_inner(backend_url, token).await {
            Ok(()) => {
                *self.state.lock() = ProxyState::Running;
                tracing::info!(port = self.config.port, backend_url, "proxy running");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ProxyState::Stopped;
                tracing::error!(error = %e, "proxy start failed");
                Err(e)
            }
        }
    }

    async fn start_inner(&self, backend_url: &str, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ProxyError::Config("access token is required".to_string()));
        }
        let backend_url = backend_url.trim_end_matches('/');
        if !backend_url.starts_with("http://") && !backend_url.starts_with("https://") {
            return Err(ProxyError::Config(format!(
                "backend url must be http(s), got {backend_url:?}"
            )));
        }

        let device = device_id()?;
        if !validate_device_id(&device) {
            return Err(ProxyError::Config(format!(
                "derived device id is invalid: {device:?}"
            )));
        }

        self.resolve_port().await?;

        let tls_config = listener::load_tls_config(&self.config.cert_path, &self.config.key_path)?;
        let tcp = TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        let port = tcp.local_addr()?.port();

        let session = Arc::new(ProxySession::new(
            token.to_string(),
            backend_url.to_string(),
            device,
        ));
        let backend = BackendClient::new(backend_url)?;
        let engine = Arc::new(ForwardingEngine::new(
            EngineConfig {
                upstream_url: backend_url.to_string(),
                local_url: format!("https://127.0.0.1:{port}"),
                pool: self.config.pool.clone(),
                cache_capacity: self.config.cache_capacity,
            },
            Arc::clone(&session),
            backend.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(listener::run_listener(
            tcp,
            TlsAcceptor::from(tls_config),
            Arc::clone(&engine),
            shutdown_rx,
        ));

        // The listener is bound but the proxy is not usable until the
        // backend accepts the token.
        *self.state.lock() = ProxyState::Authenticating;
        match backend.authenticate(token).await {
            Ok(grant) => {
                session.set_token_expires_at(grant.expires_at);
                if let Some(cookie) = grant.cookie {
                    session.set_session_cookie(cookie);
                }
            }
            Err(e) => {
                let _ = shutdown_tx.send(());
                handle.abort();
                session.purge();
                return Err(match e {
                    gangway_core::CoreError::BackendUnreachable(msg) => {
                        ProxyError::BackendUnreachable(msg)
                    }
                    other => ProxyError::Auth(format!("backend rejected token: {other}")),
                });
            }
        }

        *self.health_backend.write() = Some(backend.clone());
        self.ensure_health_watcher();

        *self.running.lock() = Some(RunningProxy {
            port,
            shutdown_tx,
            handle,
            engine,
            session,
            backend,
        });
        Ok(())
    }

    /// Frees the configured port, terminating a stale instance of our own
    /// if the inspector can attribute and kill it.
    async fn resolve_port(&self) -> Result<()> {
        let port = self.config.port;
        // Port 0 means pick any free port; nothing to resolve.
        if port == 0 {
            return Ok(());
        }
        match self.inspector.status(port) {
            PortStatus::Free => Ok(()),
            PortStatus::Busy { holder } => {
                if let Some(info) = holder.as_ref().filter(|h| h.ours) {
                    tracing::warn!(port, pid = info.pid, "terminating stale proxy instance");
                    if self.inspector.terminate(info) {
                        tokio::time::sleep(PORT_RETRY_DELAY).await;
                        if self.inspector.status(port) == PortStatus::Free {
                            return Ok(());
                        }
                    }
                }
                Err(ProxyError::PortConflict {
                    port,
                    holder: holder.map(|h| (h.pid, h.name)),
                })
            }
        }
    }

    /// Stops the proxy. Logout is best-effort; credential purge and cache
    /// clearing always happen. Idempotent when already stopped.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Stopped => return Ok(()),
                ProxyState::Running => *state = ProxyState::Stopping,
                other => {
                    return Err(ProxyError::Config(format!("cannot stop while {other}")))
                }
            }
        }

        let run = self.running.lock().take();
        if let Some(run) = run {
            match tokio::time::timeout(STOP_TIMEOUT, run.backend.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "logout failed"),
                Err(_) => tracing::warn!("logout timed out"),
            }

            let _ = run.shutdown_tx.send(());
            let mut handle = run.handle;
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("listener did not stop in time, aborting");
                handle.abort();
            }

            run.engine.clear_caches();
            run.session.purge();
            tracing::info!(port = run.port, "proxy stopped, credentials purged");
        }

        *self.state.lock() = ProxyState::Stopped;
        Ok(())
    }

    /// Snapshot of state, counters, cache stats, and last health probe.
    pub fn status(&self) -> ProxyStatus {
        let state = *self.state.lock();
        let running = self.running.lock();
        let (port, backend_url, stats, cache) = match running.as_ref() {
            Some(run) => (
                run.port,
                Some(run.session.backend_url()),
                Some(run.engine.stats().snapshot()),
                Some(run.engine.cache().stats()),
            ),
            None => (self.config.port, None, None, None),
        };

        let port_diagnostics = if running.is_none() && self.config.port != 0 {
            match self.inspector.status(self.config.port) {
                PortStatus::Free => None,
                PortStatus::Busy { holder } => Some(match holder {
                    Some(h) => format!("port {} held by {} (pid {})", self.config.port, h.name, h.pid),
                    None => format!("port {} is in use", self.config.port),
                }),
            }
        } else {
            None
        };

        ProxyStatus {
            state,
            running: state == ProxyState::Running,
            port,
            port_diagnostics,
            backend_url,
            stats,
            cache,
            health: self.last_health.read().clone(),
        }
    }

    /// Re-validates the active token against the backend and refreshes the
    /// recorded expiry.
    pub async fn refresh_token_status(&self) -> Result<TokenStatus> {
        let (backend, session) = {
            let running = self.running.lock();
            let run = running
                .as_ref()
                .ok_or_else(|| ProxyError::Config("proxy is not running".to_string()))?;
            (run.backend.clone(), Arc::clone(&run.session))
        };

        let status = backend.check_status(&session.access_token()).await?;
        if status.valid {
            session.set_token_expires_at(status.expires_at);
        } else {
            tracing::warn!("backend reports token no longer valid");
        }
        Ok(status)
    }

    /// Probes backend health once and records the report. Works whether or
    /// not the proxy is running, as long as a backend URL has been seen.
    pub async fn check_backend_health(&self) -> HealthReport {
        let backend = self.health_backend.read().clone();
        let report = match backend {
            Some(backend) => backend.check_health().await,
            None => HealthReport::unreachable("no backend configured"),
        };
        *self.last_health.write() = Some(report.clone());
        report
    }

    /// Spawns the periodic health probe. Idempotent.
    fn ensure_health_watcher(&self) {
        let mut task = self.health_task.lock();
        if task.is_some() {
            return;
        }
        let backend = Arc::clone(&self.health_backend);
        let last = Arc::clone(&self.last_health);
        let interval = self.config.health_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let client = backend.read().clone();
                if let Some(client) = client {
                    let report = client.check_health().await;
                    tracing::debug!(status = ?report.status, "backend health probe");
                    *last.write() = Some(report);
                }
            }
        }));
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ProcessInfo;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> ManagerConfig {
        // Bogus cert paths; tests that reach TLS loading expect failure.
        ManagerConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem").with_port(0)
    }

    // ==================== Start Validation Tests ====================

    #[tokio::test]
    async fn start_with_empty_token_binds_nothing() {
        let manager = ProxyManager::with_defaults(test_config());
        let err = manager
            .start("http://127.0.0.1:9", "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        let status = manager.status();
        assert_eq!(status.state, ProxyState::Stopped);
        assert!(!status.running);
        assert!(status.stats.is_none());
    }

    #[tokio::test]
    async fn start_rejects_non_http_backend_url() {
        let manager = ProxyManager::with_defaults(test_config());
        let err = manager.start("ftp://host", "token").await.unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert_eq!(manager.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn start_surfaces_tls_errors_and_resets_state() {
        let manager = ProxyManager::with_defaults(test_config());
        let err = manager
            .start("http://127.0.0.1:9", "token")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
        assert_eq!(manager.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn start_twice_is_rejected_while_not_stopped() {
        let manager = ProxyManager::with_defaults(test_config());
        // First start fails on TLS, which resets to Stopped; force the
        // state to Running to exercise the guard.
        *manager.state.lock() = ProxyState::Running;
        let err = manager.start("http://127.0.0.1:9", "token").await.unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    // ==================== Port Resolution Tests ====================

    struct FixedInspector {
        status: PortStatus,
        terminations: AtomicUsize,
    }

    impl PortInspector for FixedInspector {
        fn status(&self, _port: u16) -> PortStatus {
            if self.terminations.load(Ordering::SeqCst) > 0 {
                PortStatus::Free
            } else {
                self.status.clone()
            }
        }

        fn terminate(&self, _info: &ProcessInfo) -> bool {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn foreign_holder_is_a_conflict() {
        let inspector = Arc::new(FixedInspector {
            status: PortStatus::Busy {
                holder: Some(ProcessInfo {
                    pid: 4242,
                    name: "other-server".to_string(),
                    ours: false,
                }),
            },
            terminations: AtomicUsize::new(0),
        });
        let config = ManagerConfig::new("/c", "/k").with_port(61000);
        let manager = ProxyManager::new(config, inspector.clone());

        let err = manager.resolve_port().await.unwrap_err();
        match err {
            ProxyError::PortConflict { port, holder } => {
                assert_eq!(port, 61000);
                assert_eq!(holder, Some((4242, "other-server".to_string())));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Foreign processes are never terminated.
        assert_eq!(inspector.terminations.load(Ordering::SeqCst), 0);
    }

    // Paused time: the retry wait between terminate and re-probe must not
    // block the runtime, so it auto-advances here.
    #[tokio::test(start_paused = true)]
    async fn stale_own_instance_is_terminated_and_port_reused() {
        let inspector = Arc::new(FixedInspector {
            status: PortStatus::Busy {
                holder: Some(ProcessInfo {
                    pid: 77,
                    name: "gangway".to_string(),
                    ours: true,
                }),
            },
            terminations: AtomicUsize::new(0),
        });
        let config = ManagerConfig::new("/c", "/k").with_port(61000);
        let manager = ProxyManager::new(config, inspector.clone());

        manager.resolve_port().await.unwrap();
        assert_eq!(inspector.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_port_without_holder_is_a_conflict() {
        let inspector = Arc::new(FixedInspector {
            status: PortStatus::Busy { holder: None },
            terminations: AtomicUsize::new(0),
        });
        let config = ManagerConfig::new("/c", "/k").with_port(61000);
        let manager = ProxyManager::new(config, inspector);

        let err = manager.resolve_port().await.unwrap_err();
        assert!(matches!(err, ProxyError::PortConflict { holder: None, .. }));
    }

    // ==================== Stop Tests ====================

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let manager = ProxyManager::with_defaults(test_config());
        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ProxyState::Stopped);
    }

    // ==================== Lifecycle Tests ====================

    /// Minimal canned backend speaking just enough HTTP/1.1 for the
    /// authenticate call, the logout call, and health probes. Logout is
    /// refused with a 500 so stop's best-effort handling stays covered.
    async fn spawn_fake_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let Ok(n) = stream.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                            let body_len = head
                                .lines()
                                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                                .and_then(|l| l.split_once(':'))
                                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if buf.len() >= header_end + 4 + body_len {
                                break;
                            }
                        }
                    }
                    let request = String::from_utf8_lossy(&buf).to_string();
                    let (status, body) = if request.starts_with("POST") {
                        ("200 OK", r#"{"user_id":"u1","expires_at":null}"#)
                    } else if request.starts_with("DELETE") {
                        // Logout rejection: stop must still purge and report Ok.
                        ("500 Internal Server Error", r#"{"detail":"session gone"}"#)
                    } else if request.contains("/health") {
                        ("200 OK", r#"{"status":"healthy"}"#)
                    } else {
                        ("200 OK", "{}")
                    };
                    let cookie_line = if request.starts_with("POST") {
                        "Set-Cookie: gangway_session=fake-cookie; Path=/; Max-Age=3600\r\n"
                    } else {
                        ""
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        cookie_line,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn write_self_signed_material(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        // A throwaway key pair generated once with openssl; only used to
        // satisfy the TLS listener in tests.
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(TEST_CERT.as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(TEST_KEY.as_bytes())
            .unwrap();
        (cert_path, key_path)
    }

    #[tokio::test]
    async fn start_authenticates_then_stop_purges_despite_failed_logout() {
        let backend_url = spawn_fake_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed_material(dir.path());
        let config = ManagerConfig::new(cert, key).with_port(0);
        let manager = ProxyManager::with_defaults(config);

        manager.start(&backend_url, "good-token").await.unwrap();
        assert_eq!(manager.state(), ProxyState::Running);

        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.backend_url.as_deref(), Some(backend_url.as_str()));

        let session = {
            let running = manager.running.lock();
            Arc::clone(&running.as_ref().unwrap().session)
        };
        assert!(session.session_cookie().is_some());

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ProxyState::Stopped);
        assert!(session.is_purged());
        assert!(manager.status().stats.is_none());
    }

    #[tokio::test]
    async fn start_with_unreachable_backend_reports_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed_material(dir.path());
        let config = ManagerConfig::new(cert, key).with_port(0);
        let manager = ProxyManager::with_defaults(config);

        // Port 9 is the discard port; nothing listens there.
        let err = manager
            .start("http://127.0.0.1:9", "token")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnreachable(_)));
        assert_eq!(manager.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn health_probe_without_backend_is_unreachable() {
        let manager = ProxyManager::with_defaults(test_config());
        let report = manager.check_backend_health().await;
        assert_eq!(report.status, gangway_core::HealthStatus::Unreachable);
        assert!(manager.status().health.is_some());
    }

    #[tokio::test]
    async fn health_probe_reaches_backend() {
        let backend_url = spawn_fake_backend().await;
        let manager = ProxyManager::with_defaults(test_config());
        *manager.health_backend.write() = Some(BackendClient::new(&backend_url).unwrap());

        let report = manager.check_backend_health().await;
        assert_eq!(report.status, gangway_core::HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn refresh_token_status_requires_running_proxy() {
        let manager = ProxyManager::with_defaults(test_config());
        let err = manager.refresh_token_status().await.unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    // RSA test material, valid PEM but only for loopback tests.
    const TEST_CERT: &str = include_str!("../testdata/test_cert.pem");
    const TEST_KEY: &str = include_str!("../testdata/test_key.pem");
}
