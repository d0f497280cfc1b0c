// Packet filter backend trait and implementations
//
// A filter backend owns a session with the OS packet-filtering subsystem and
// installs per-(pid, direction) rules that route matching packets through a
// shaping point.

use crate::backends::{BackendInfo, BackendPriority};
use crate::budget::ShapingPoint;
use crate::flow::{Direction, LocalPorts};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

pub mod manager;
pub mod unsupported;

#[cfg(test)]
pub mod mock;

#[cfg(all(target_os = "linux", feature = "throttle-nfqueue"))]
pub mod linux;

pub use manager::FilterManager;

/// Opaque id of one installed filter rule
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct FilterHandle(u64);

impl FilterHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Settings a backend needs to build its session
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub nft_table: String,
    pub cgroup_name: String,
    pub queue_base: u16,
    pub queue_max_len: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            nft_table: "procshaper".to_string(),
            cgroup_name: "procshaper".to_string(),
            queue_base: 7100,
            queue_max_len: 1024,
        }
    }
}

/// Packet filtering backend trait
///
/// Implementations are driven exclusively through [`FilterManager`], which
/// guarantees that `remove` is only called with handles this backend issued
/// and not yet removed, and that `close` is only called with no rules left.
pub trait FilterBackend: Send {
    /// Backend name (e.g., "nfqueue", "unsupported")
    fn name(&self) -> &'static str;

    /// Backend priority, reported by `--list-backends`
    fn priority() -> BackendPriority
    where
        Self: Sized;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Open the session with the filtering subsystem
    fn open(&mut self) -> Result<()>;

    /// Tear the session down
    fn close(&mut self) -> Result<()>;

    /// Route `pid`'s traffic in `direction` through `point`
    fn install(
        &mut self,
        pid: u32,
        direction: Direction,
        point: Arc<ShapingPoint>,
    ) -> Result<FilterHandle>;

    /// Also route packets of sockets the process already had when the
    /// filter was installed, identified by local port. Each call replaces
    /// the previous port set of `handle`.
    fn track_ports(&mut self, handle: FilterHandle, ports: &LocalPorts) -> Result<()>;

    /// Remove one previously installed rule
    fn remove(&mut self, handle: FilterHandle) -> Result<()>;
}

/// Detect all filter backends for this platform
pub fn detect_filter_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(all(target_os = "linux", feature = "throttle-nfqueue"))]
    {
        backends.push(BackendInfo {
            name: "nfqueue",
            priority: linux::NfqueueBackend::priority(),
            available: linux::NfqueueBackend::is_available(),
        });
    }

    backends.push(BackendInfo {
        name: "unsupported",
        priority: unsupported::UnsupportedBackend::priority(),
        available: true,
    });

    backends
}

/// Create the best filter backend for this platform
///
/// Availability is not checked here: a backend that cannot work reports it
/// from `open()`, so the failure surfaces on the first throttle request.
pub fn create_filter_backend(settings: FilterSettings) -> Box<dyn FilterBackend> {
    #[cfg(all(target_os = "linux", feature = "throttle-nfqueue"))]
    {
        Box::new(linux::NfqueueBackend::new(settings))
    }

    #[cfg(not(all(target_os = "linux", feature = "throttle-nfqueue")))]
    {
        let _ = settings;
        Box::new(unsupported::UnsupportedBackend)
    }
}
