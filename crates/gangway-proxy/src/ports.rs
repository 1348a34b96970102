//! Local port inspection.
//!
//! The manager asks a [`PortInspector`] who holds the proxy port before
//! binding. The default [`SocketProbe`] only probes by binding, so it can
//! say busy or free but never who the holder is; richer platform-specific
//! inspectors can be injected for holder attribution and cleanup of stale
//! instances.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// A process found holding a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// True when the holder is a previous instance of this proxy.
    pub ours: bool,
}

/// Outcome of a port inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStatus {
    Free,
    Busy { holder: Option<ProcessInfo> },
}

/// Answers whether a port is free and, when possible, who holds it.
pub trait PortInspector: Send + Sync {
    fn status(&self, port: u16) -> PortStatus;

    /// Attempts to terminate the holder. Inspectors without that ability
    /// report failure.
    fn terminate(&self, _info: &ProcessInfo) -> bool {
        false
    }
}

/// Default inspector: a bind probe on the loopback interface. No holder
/// attribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketProbe;

impl PortInspector for SocketProbe {
    fn status(&self, port: u16) -> PortStatus {
        match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
            Ok(_) => PortStatus::Free,
            Err(_) => PortStatus::Busy { holder: None },
        }
    }
}
