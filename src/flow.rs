//! Flow identity types shared by classification, metering and shaping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Traffic direction relative to the local host
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    /// Ingress traffic
    Download,
    /// Egress traffic
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// A single network conversation seen from the local side.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(local: SocketAddr, remote: SocketAddr, protocol: Protocol) -> Self {
        Self {
            local,
            remote,
            protocol,
        }
    }

    /// Build the key for a packet travelling `src -> dst`, assuming the
    /// given direction. Outbound packets have the local side as source.
    pub fn from_packet(
        src: SocketAddr,
        dst: SocketAddr,
        protocol: Protocol,
        direction: Direction,
    ) -> Self {
        match direction {
            Direction::Upload => Self::new(src, dst, protocol),
            Direction::Download => Self::new(dst, src, protocol),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} <-> {}", self.protocol, self.local, self.remote)
    }
}

/// Local ports a process holds sockets on, per transport protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPorts {
    pub tcp: BTreeSet<u16>,
    pub udp: BTreeSet<u16>,
}

impl LocalPorts {
    pub fn insert(&mut self, protocol: Protocol, port: u16) {
        match protocol {
            Protocol::Tcp => self.tcp.insert(port),
            Protocol::Udp => self.udp.insert(port),
        };
    }

    pub fn get(&self, protocol: Protocol) -> &BTreeSet<u16> {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }
}
