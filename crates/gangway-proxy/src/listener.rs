//! TLS listener lifecycle.
//!
//! Binds the local port, terminates TLS with rustls, and serves each
//! connection with hyper's HTTP/1 connection driver. A broadcast channel
//! stops the accept loop; in-flight connections finish on their own.

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::engine::ForwardingEngine;
use crate::error::{ProxyError, Result};

/// Loads a PEM certificate chain and private key into a rustls server
/// config.
pub fn load_tls_config(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        ProxyError::Tls(format!("cannot open certificate {}: {e}", cert_path.display()))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProxyError::Tls(format!("invalid certificate: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ProxyError::Tls(format!("cannot open key {}: {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ProxyError::Tls(format!("invalid private key: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("tls config rejected: {e}")))?;

    Ok(Arc::new(config))
}

/// Accept loop. Runs until the shutdown channel fires, spawning one task
/// per connection.
pub async fn run_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    engine: Arc<ForwardingEngine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            tracing::debug!(error = %e, %peer, "tls handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |req| {
                        let engine = Arc::clone(&engine);
                        async move {
                            Ok::<_, std::convert::Infallible>(engine.handle(req, peer).await)
                        }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!(error = %e, %peer, "connection ended with error");
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("listener shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ==================== TLS Config Tests ====================

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_tls_config(
            std::path::Path::new("/nonexistent/cert.pem"),
            std::path::Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[test]
    fn empty_cert_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::File::create(&cert)
            .unwrap()
            .write_all(b"")
            .unwrap();
        std::fs::File::create(&key).unwrap().write_all(b"").unwrap();

        let err = load_tls_config(&cert, &key).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }
}
