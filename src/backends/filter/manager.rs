// FilterManager owns the filtering session and every installed filter

use super::{FilterBackend, FilterHandle};
use crate::budget::ShapingPoint;
use crate::error::{ThrottleError, ThrottleResult, is_permission_error};
use crate::flow::{Direction, LocalPorts};
use std::collections::HashSet;
use std::sync::Arc;

/// Download and upload filters of one throttled process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPair {
    pub download: FilterHandle,
    pub upload: FilterHandle,
}

/// Session lifecycle and handle bookkeeping on top of a [`FilterBackend`].
///
/// The set of live handles doubles as the session refcount: the session may
/// only close once it is empty, and a handle leaves the set exactly once.
pub struct FilterManager {
    backend: Box<dyn FilterBackend>,
    open: bool,
    live: HashSet<FilterHandle>,
}

impl FilterManager {
    pub fn new(backend: Box<dyn FilterBackend>) -> Self {
        Self {
            backend,
            open: false,
            live: HashSet::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of installed filters referencing the session
    pub fn live_filters(&self) -> usize {
        self.live.len()
    }

    /// Open the session. A no-op when already open; failures are reported
    /// as-is and never retried.
    pub fn open(&mut self) -> ThrottleResult<()> {
        if self.open {
            return Ok(());
        }

        if let Err(e) = self.backend.open() {
            log::warn!(
                "Failed to open filtering session ({}): {:#}",
                self.backend.name(),
                e
            );
            return Err(if is_permission_error(&e) {
                ThrottleError::PermissionDenied(format!("{:#}", e))
            } else {
                ThrottleError::EngineUnavailable(format!("{:#}", e))
            });
        }

        self.open = true;
        log::info!("Opened filtering session ({})", self.backend.name());
        Ok(())
    }

    /// Close the session. Fails while any filter is still installed.
    pub fn close(&mut self) -> ThrottleResult<()> {
        if !self.live.is_empty() {
            return Err(ThrottleError::SessionInUse(self.live.len()));
        }
        if !self.open {
            return Ok(());
        }

        self.open = false;
        self.backend.close().map_err(ThrottleError::from_backend)?;
        log::info!("Closed filtering session ({})", self.backend.name());
        Ok(())
    }

    pub fn install(
        &mut self,
        pid: u32,
        direction: Direction,
        point: Arc<ShapingPoint>,
    ) -> ThrottleResult<FilterHandle> {
        if !self.open {
            return Err(ThrottleError::EngineUnavailable(
                "filtering session is not open".to_string(),
            ));
        }

        let handle = self
            .backend
            .install(pid, direction, point)
            .map_err(ThrottleError::from_backend)?;

        if !self.live.insert(handle) {
            log::error!(
                "Backend {} reissued live filter handle {}",
                self.backend.name(),
                handle
            );
        }
        log::debug!("Installed {} filter {} for PID {}", direction, handle, pid);
        Ok(handle)
    }

    /// Install both directions or neither.
    pub fn install_pair(
        &mut self,
        pid: u32,
        download: Arc<ShapingPoint>,
        upload: Arc<ShapingPoint>,
    ) -> ThrottleResult<FilterPair> {
        let download_handle = self.install(pid, Direction::Download, download)?;

        match self.install(pid, Direction::Upload, upload) {
            Ok(upload_handle) => Ok(FilterPair {
                download: download_handle,
                upload: upload_handle,
            }),
            Err(e) => {
                if let Err(rollback) = self.remove(download_handle) {
                    log::warn!(
                        "Rollback of download filter {} for PID {} failed: {}",
                        download_handle,
                        pid,
                        rollback
                    );
                }
                Err(ThrottleError::PartialInstall {
                    pid,
                    source: anyhow::Error::new(e),
                })
            }
        }
    }

    /// Point an installed filter at the given pre-existing sockets
    pub fn track_ports(&mut self, handle: FilterHandle, ports: &LocalPorts) -> ThrottleResult<()> {
        if !self.live.contains(&handle) {
            return Err(ThrottleError::UnknownHandle(handle.id()));
        }

        self.backend
            .track_ports(handle, ports)
            .map_err(ThrottleError::from_backend)?;
        log::trace!("Filter {} tracks {} local ports", handle, ports.len());
        Ok(())
    }

    /// Remove a filter. The handle is retired before the backend is asked,
    /// so a backend failure never leaves it eligible for a second removal.
    pub fn remove(&mut self, handle: FilterHandle) -> ThrottleResult<()> {
        if !self.live.remove(&handle) {
            return Err(ThrottleError::UnknownHandle(handle.id()));
        }

        self.backend
            .remove(handle)
            .map_err(ThrottleError::from_backend)?;
        log::debug!("Removed filter {}", handle);
        Ok(())
    }

    /// Remove both filters of a pair, reporting the first failure.
    pub fn remove_pair(&mut self, pair: FilterPair) -> ThrottleResult<()> {
        let download = self.remove(pair.download);
        let upload = self.remove(pair.upload);
        download.and(upload)
    }
}
