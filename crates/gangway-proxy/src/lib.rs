//! Local TLS-terminating forwarding proxy.
//!
//! Sits between a single user agent and a remote backend: terminates TLS
//! on the loopback interface, injects credentials per client type, caches
//! static responses, rewrites embedded URLs so content keeps resolving
//! through the proxy, deduplicates identical in-flight GETs, and tunnels
//! WebSocket upgrades. [`ProxyManager`] drives the whole lifecycle.

pub mod cache;
pub mod classify;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod listener;
pub mod manager;
pub mod ports;
pub mod rewrite;
mod ws;

pub use cache::{CacheEntry, CacheManager, CacheStats, DEFAULT_CACHE_CAPACITY};
pub use classify::{classify_user_agent, ClientKind};
pub use engine::{
    ConnectionPoolConfig, EngineConfig, EngineStats, ForwardingEngine, ForwardingStats, ProxyBody,
    STREAMING_THRESHOLD,
};
pub use error::{ProxyError, Result};
pub use manager::{ManagerConfig, ProxyManager, ProxyState, ProxyStatus, DEFAULT_PROXY_PORT};
pub use ports::{PortInspector, PortStatus, ProcessInfo, SocketProbe};
pub use rewrite::ContentRewriter;
