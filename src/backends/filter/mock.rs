// Counting filter backend for tests

use super::{FilterBackend, FilterHandle};
use crate::backends::BackendPriority;
use crate::budget::ShapingPoint;
use crate::flow::{Direction, LocalPorts};
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Everything the mock saw, plus knobs to make it fail
#[derive(Debug, Default)]
pub struct MockState {
    pub opens: usize,
    pub closes: usize,
    pub install_attempts: usize,
    pub installs: Vec<(u32, Direction, FilterHandle)>,
    pub removed: Vec<FilterHandle>,
    /// Removes of handles that were never installed or already removed
    pub invalid_removes: usize,
    pub live: HashMap<FilterHandle, (u32, Direction, Arc<ShapingPoint>)>,
    /// Port set most recently tracked per live handle
    pub tracked: HashMap<FilterHandle, LocalPorts>,

    pub fail_open: bool,
    /// Fail the Nth install attempt (1-based)
    pub fail_install_on: Option<usize>,
    pub fail_all_installs: bool,
    pub fail_removes: bool,
    pub fail_tracking: bool,
    pub deny_permission: bool,
}

impl MockState {
    /// Shaping point currently installed for `pid` in `direction`
    pub fn point_for(&self, pid: u32, direction: Direction) -> Option<Arc<ShapingPoint>> {
        self.live
            .values()
            .find(|(p, d, _)| *p == pid && *d == direction)
            .map(|(_, _, point)| point.clone())
    }

    pub fn handle_for(&self, pid: u32, direction: Direction) -> Option<FilterHandle> {
        self.live
            .iter()
            .find(|(_, (p, d, _))| *p == pid && *d == direction)
            .map(|(handle, _)| *handle)
    }

    pub fn live_for(&self, pid: u32) -> usize {
        self.live.values().filter(|(p, _, _)| *p == pid).count()
    }
}

pub type SharedMockState = Arc<Mutex<MockState>>;

pub struct CountingBackend {
    state: SharedMockState,
    next_id: u64,
}

impl CountingBackend {
    pub fn new() -> (Self, SharedMockState) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
                next_id: 1,
            },
            state,
        )
    }
}

impl FilterBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        true
    }

    fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(anyhow!("mock engine refused to open"));
        }
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }

    fn install(
        &mut self,
        pid: u32,
        direction: Direction,
        point: Arc<ShapingPoint>,
    ) -> Result<FilterHandle> {
        let mut state = self.state.lock().unwrap();
        state.install_attempts += 1;

        if state.deny_permission {
            return Err(anyhow::Error::new(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            ))
            .context("mock install"));
        }
        if state.fail_all_installs || state.fail_install_on == Some(state.install_attempts) {
            return Err(anyhow!("mock install {} failed", state.install_attempts));
        }

        let handle = FilterHandle::new(self.next_id);
        self.next_id += 1;
        state.installs.push((pid, direction, handle));
        state.live.insert(handle, (pid, direction, point));
        Ok(handle)
    }

    fn track_ports(&mut self, handle: FilterHandle, ports: &LocalPorts) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.live.contains_key(&handle) {
            return Err(anyhow!("mock filter {} not installed", handle));
        }
        if state.fail_tracking {
            return Err(anyhow!("mock tracking of {} failed", handle));
        }
        state.tracked.insert(handle, ports.clone());
        Ok(())
    }

    fn remove(&mut self, handle: FilterHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tracked.remove(&handle);
        match state.live.remove(&handle) {
            Some((_, _, point)) => {
                point.retire();
                state.removed.push(handle);
            }
            None => state.invalid_removes += 1,
        }
        if state.fail_removes {
            return Err(anyhow!("mock remove of {} failed", handle));
        }
        Ok(())
    }
}
