//! Registry of active throttles and their filters.

use crate::backends::filter::manager::FilterPair;
use crate::backends::filter::{FilterBackend, FilterManager};
use crate::budget::{ShapingPoint, ShapingStats};
use crate::error::{ThrottleError, ThrottleResult};
use crate::flow::LocalPorts;
use crate::process::ThrottleLimits;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One throttled process: a shaping point per direction and the filters
/// routing its packets through them.
struct ThrottleEntry {
    limits: ThrottleLimits,
    download: Arc<ShapingPoint>,
    upload: Arc<ShapingPoint>,
    filters: FilterPair,
}

/// Shaping counters of an active throttle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub download: ShapingStats,
    pub upload: ShapingStats,
}

struct EngineState {
    filters: FilterManager,
    entries: HashMap<u32, ThrottleEntry>,
}

impl EngineState {
    fn stop(&mut self, pid: u32) -> ThrottleResult<()> {
        let entry = self
            .entries
            .remove(&pid)
            .ok_or(ThrottleError::NotThrottled(pid))?;

        let removed = self.filters.remove_pair(entry.filters);
        if let Err(e) = &removed {
            log::warn!("Throttle on PID {} dropped with filter error: {}", pid, e);
        } else {
            log::info!("Stopped throttle on PID {}", pid);
        }

        // Last throttle gone: nothing references the session any more
        if self.entries.is_empty() {
            if let Err(e) = self.filters.close() {
                log::warn!("Failed to close filtering session: {}", e);
            }
        }

        removed
    }
}

/// Keyed registry of active throttles, at most one per pid.
///
/// Registry and filter session sit behind a single lock; the per-packet
/// path only touches the shaping points, each with its own lock.
pub struct ThrottleEngine {
    state: Mutex<EngineState>,
    max_wait: Duration,
}

impl ThrottleEngine {
    pub fn new(backend: Box<dyn FilterBackend>, max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(EngineState {
                filters: FilterManager::new(backend),
                entries: HashMap::new(),
            }),
            max_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend_name(&self) -> &'static str {
        self.lock().filters.backend_name()
    }

    pub fn session_open(&self) -> bool {
        self.lock().filters.is_open()
    }

    /// Throttle `pid`, replacing any existing throttle on it.
    ///
    /// A limit of 0 blocks the direction entirely. The new filters are
    /// installed before the old ones are removed; if installing fails the
    /// engine is left exactly as it was.
    pub fn start(&self, pid: u32, download_limit: u64, upload_limit: u64) -> ThrottleResult<()> {
        let mut state = self.lock();

        let was_open = state.filters.is_open();
        state.filters.open()?;

        let download = Arc::new(ShapingPoint::new(download_limit, self.max_wait));
        let upload = Arc::new(ShapingPoint::new(upload_limit, self.max_wait));

        let filters = match state
            .filters
            .install_pair(pid, download.clone(), upload.clone())
        {
            Ok(filters) => filters,
            Err(e) => {
                if !was_open {
                    let _ = state.filters.close();
                }
                log::warn!("Failed to throttle PID {}: {}", pid, e);
                return Err(e);
            }
        };

        let entry = ThrottleEntry {
            limits: ThrottleLimits {
                download_limit,
                upload_limit,
            },
            download,
            upload,
            filters,
        };

        match state.entries.insert(pid, entry) {
            Some(old) => {
                if let Err(e) = state.filters.remove_pair(old.filters) {
                    log::warn!("Failed to remove replaced filters of PID {}: {}", pid, e);
                }
                log::info!(
                    "Replaced throttle on PID {} (down {} B/s, up {} B/s)",
                    pid,
                    download_limit,
                    upload_limit
                );
            }
            None => log::info!(
                "Throttling PID {} (down {} B/s, up {} B/s)",
                pid,
                download_limit,
                upload_limit
            ),
        }

        Ok(())
    }

    /// Remove the throttle on `pid`.
    ///
    /// The entry is gone afterwards even when a filter removal reports an
    /// error; that error is still returned.
    pub fn stop(&self, pid: u32) -> ThrottleResult<()> {
        self.lock().stop(pid)
    }

    pub fn is_active(&self, pid: u32) -> bool {
        self.lock().entries.contains_key(&pid)
    }

    /// Point each throttle's filters at the sockets its process holds.
    ///
    /// Sockets created before `start` are not matched by the filters
    /// themselves, so callers pass the current local ports per pid after
    /// every connection table refresh. Every entry is attempted; the first
    /// failure is returned.
    pub fn track_ports<F>(&self, ports_of: F) -> ThrottleResult<()>
    where
        F: Fn(u32) -> LocalPorts,
    {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut first_error = None;
        for (&pid, entry) in &state.entries {
            let ports = ports_of(pid);
            for handle in [entry.filters.download, entry.filters.upload] {
                if let Err(e) = state.filters.track_ports(handle, &ports) {
                    log::warn!("Failed to track existing sockets of PID {}: {}", pid, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Stop every throttle whose process is no longer alive. Returns the
    /// pids that were released.
    pub fn sweep<F>(&self, is_alive: F) -> Vec<u32>
    where
        F: Fn(u32) -> bool,
    {
        let mut state = self.lock();

        let mut stale: Vec<u32> = state
            .entries
            .keys()
            .copied()
            .filter(|pid| !is_alive(*pid))
            .collect();
        stale.sort_unstable();

        for pid in &stale {
            let _ = state.stop(*pid);
        }

        if !stale.is_empty() {
            log::info!("Released throttles of exited processes: {:?}", stale);
        }
        stale
    }

    /// Stop every throttle through the normal path, then close the session.
    pub fn shutdown(&self) {
        let mut state = self.lock();

        let pids: Vec<u32> = state.entries.keys().copied().collect();
        for pid in pids {
            let _ = state.stop(pid);
        }

        if let Err(e) = state.filters.close() {
            log::warn!("Failed to close filtering session: {}", e);
        }
    }

    pub fn limits(&self, pid: u32) -> Option<ThrottleLimits> {
        self.lock().entries.get(&pid).map(|entry| entry.limits)
    }

    pub fn stats(&self, pid: u32) -> Option<ThrottleStats> {
        self.lock().entries.get(&pid).map(|entry| ThrottleStats {
            download: entry.download.stats(),
            upload: entry.upload.stats(),
        })
    }

    pub fn active_throttles(&self) -> BTreeMap<u32, ThrottleLimits> {
        self.lock()
            .entries
            .iter()
            .map(|(&pid, entry)| (pid, entry.limits))
            .collect()
    }
}

impl Drop for ThrottleEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
