// Filter backend for platforms without a packet interception mechanism

use super::{FilterBackend, FilterHandle};
use crate::backends::BackendPriority;
use crate::budget::ShapingPoint;
use crate::flow::{Direction, LocalPorts};
use anyhow::{Result, anyhow};
use std::sync::Arc;

/// Backend whose session can never be opened
pub struct UnsupportedBackend;

impl FilterBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        true
    }

    fn open(&mut self) -> Result<()> {
        Err(anyhow!(
            "no packet filtering backend for this platform (build on Linux with the throttle-nfqueue feature)"
        ))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn install(
        &mut self,
        pid: u32,
        direction: Direction,
        _point: Arc<ShapingPoint>,
    ) -> Result<FilterHandle> {
        Err(anyhow!(
            "cannot install {} filter for PID {}: no session",
            direction,
            pid
        ))
    }

    fn track_ports(&mut self, handle: FilterHandle, _ports: &LocalPorts) -> Result<()> {
        Err(anyhow!("cannot track ports of filter {}: no session", handle))
    }

    fn remove(&mut self, handle: FilterHandle) -> Result<()> {
        Err(anyhow!("cannot remove filter {}: no session", handle))
    }
}
