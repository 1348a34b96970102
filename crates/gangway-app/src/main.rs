//! Gangway - local TLS-terminating proxy for a remote backend.
//!
//! Starts the proxy on the loopback interface, authenticates against the
//! backend, prints status, and runs until interrupted. Stopping always
//! purges credentials from memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gangway_proxy::{ManagerConfig, ProxyManager, DEFAULT_PROXY_PORT};

/// Gangway - local TLS-terminating proxy for a remote backend
#[derive(Parser, Debug)]
#[command(name = "gangway", version, about)]
struct Args {
    /// Backend base URL to forward traffic to
    #[arg(long)]
    backend_url: String,

    /// Access token for the backend (falls back to GANGWAY_TOKEN)
    #[arg(long, env = "GANGWAY_TOKEN", hide_env_values = true)]
    token: String,

    /// Local port to listen on
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// PEM certificate for the local TLS listener
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key for the local TLS listener
    #[arg(long)]
    key: PathBuf,

    /// Directory for log files (console only when omitted)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Initialize logging, optionally with daily file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gangway={},warn", args.log_level)));

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("gangway")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Gangway...");

    let config = ManagerConfig::new(&args.cert, &args.key).with_port(args.port);
    let manager = Arc::new(ProxyManager::with_defaults(config));

    manager
        .start(&args.backend_url, &args.token)
        .await
        .map_err(|e| anyhow::anyhow!("start failed: {e}"))?;

    let status = manager.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    tracing::info!(
        port = status.port,
        backend_url = %args.backend_url,
        "proxy ready, press Ctrl-C to stop"
    );

    // Periodic token re-validation while the proxy runs.
    let watcher = Arc::clone(&manager);
    let token_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match watcher.refresh_token_status().await {
                Ok(status) if !status.valid => {
                    tracing::warn!("access token is no longer valid");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "token status check failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, stopping proxy");
    token_task.abort();

    manager
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("stop failed: {e}"))?;
    tracing::info!("Gangway shut down");
    Ok(())
}
