// Per-process byte counter backends
//
// A counter source reports cumulative received/transmitted bytes per pid.
// Turning those into speeds is the TrafficMeter's job.

use super::{BackendInfo, BackendPriority};
use crate::classifier::FlowClassifier;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[cfg(feature = "monitor-pnet")]
pub mod pnet;

/// Cumulative byte counters of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Byte counter backend trait
pub trait CounterSource: Send + Sync {
    /// Backend name (e.g., "pnet", "none")
    fn name(&self) -> &'static str;

    /// Backend priority, reported by `--list-backends`
    fn priority() -> BackendPriority
    where
        Self: Sized;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Snapshot of cumulative counters for every pid seen so far
    fn counters(&self) -> Result<HashMap<u32, ByteCounters>>;

    /// Forget pids that are no longer alive
    fn retain_pids(&self, _live: &HashSet<u32>) {}
}

/// Counter source that never sees traffic
pub struct NullCounterSource;

impl CounterSource for NullCounterSource {
    fn name(&self) -> &'static str {
        "none"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        true
    }

    fn counters(&self) -> Result<HashMap<u32, ByteCounters>> {
        Ok(HashMap::new())
    }
}

/// Detect all available counter sources on current system
pub fn detect_counter_sources() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "monitor-pnet")]
    {
        backends.push(BackendInfo {
            name: "pnet",
            priority: pnet::PnetCounterSource::priority(),
            available: pnet::PnetCounterSource::is_available(),
        });
    }

    backends.push(BackendInfo {
        name: "none",
        priority: NullCounterSource::priority(),
        available: true,
    });

    backends
}

/// Auto-select best available counter source.
///
/// Capture failures degrade to [`NullCounterSource`]: throttling still works
/// without live speeds.
pub fn select_counter_source(
    interface: Option<&str>,
    classifier: Arc<FlowClassifier>,
) -> Box<dyn CounterSource> {
    #[cfg(feature = "monitor-pnet")]
    {
        if pnet::PnetCounterSource::is_available() {
            match pnet::PnetCounterSource::new(interface, classifier) {
                Ok(source) => return Box::new(source),
                Err(e) => log::warn!("Packet capture unavailable, speeds will read 0: {:#}", e),
            }
        }
    }

    #[cfg(not(feature = "monitor-pnet"))]
    {
        let _ = (interface, classifier);
    }

    Box::new(NullCounterSource)
}
