// Cross-platform socket-to-PID mapping backend system
//
// This module provides a trait-based abstraction for socket-to-PID mapping
// that works across different operating systems:
// - Linux: procfs (/proc/net/tcp, etc.)
// - Windows: IP Helper (GetExtendedTcpTable/GetExtendedUdpTable)
// - Elsewhere: an empty table, so every flow stays unresolved

use crate::backends::BackendPriority;
use crate::flow::Protocol;
use anyhow::Result;
use std::net::{IpAddr, SocketAddr};

/// One row of the OS connection table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub protocol: Protocol,
    pub local: SocketAddr,
    /// `None` for listening TCP sockets and unconnected UDP sockets
    pub remote: Option<SocketAddr>,
    pub pid: u32,
}

impl SocketOwner {
    pub fn new(protocol: Protocol, local: SocketAddr, remote: SocketAddr, pid: u32) -> Self {
        Self {
            protocol,
            local,
            remote: connected_peer(remote),
            pid,
        }
    }
}

/// `0.0.0.0:0` and `[::]:0` mean "no peer" in every connection table
fn connected_peer(remote: SocketAddr) -> Option<SocketAddr> {
    if remote.ip().is_unspecified() && remote.port() == 0 {
        None
    } else {
        Some(remote)
    }
}

/// Cross-platform socket-to-PID mapping backend trait
///
/// This trait abstracts the platform-specific mechanisms for determining
/// which process owns which network socket/connection.
pub trait ConnectionTable: Send + Sync {
    /// Backend name (e.g., "procfs", "iphelper")
    fn name(&self) -> &'static str;

    /// Backend priority, reported by `--list-backends`
    fn priority() -> BackendPriority
    where
        Self: Sized;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Snapshot every TCP/UDP socket with an owning pid
    fn socket_owners(&self) -> Result<Vec<SocketOwner>>;
}

/// Connection table that knows no sockets
pub struct NullConnectionTable;

impl ConnectionTable for NullConnectionTable {
    fn name(&self) -> &'static str {
        "none"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        true
    }

    fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
        Ok(Vec::new())
    }
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) back to IPv4.
///
/// Dual-stack sockets report v4 peers in mapped form while captured
/// packets carry plain IPv4 headers.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

// Platform-specific modules
#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

// Platform-specific re-exports and functions
#[cfg(target_os = "linux")]
pub use linux::{detect_connection_tables, select_connection_table};

#[cfg(target_os = "windows")]
pub use windows::{detect_connection_tables, select_connection_table};

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn detect_connection_tables() -> Vec<crate::backends::BackendInfo> {
    vec![crate::backends::BackendInfo {
        name: "none",
        priority: NullConnectionTable::priority(),
        available: true,
    }]
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn select_connection_table(preference: Option<&str>) -> Result<Box<dyn ConnectionTable>> {
    match preference {
        None | Some("none") => Ok(Box::new(NullConnectionTable)),
        Some(name) => Err(anyhow::anyhow!("Unknown socket mapper: {}", name)),
    }
}
