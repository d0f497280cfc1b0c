//! Snapshot of the live OS process table.

use crate::backends::process::{AccessLevel, ProcessSource};
use crate::process::ProcessRecord;
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

/// Enumerates processes and keeps the last snapshot sorted by pid.
///
/// Processes the OS will not let us open are kept with an empty name and
/// path; a throttle on such a process must stay visible.
pub struct ProcessRegistry {
    source: Box<dyn ProcessSource>,
    processes: BTreeMap<u32, ProcessRecord>,
}

impl ProcessRegistry {
    pub fn new(source: Box<dyn ProcessSource>) -> Self {
        Self {
            source,
            processes: BTreeMap::new(),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Re-enumerate the process table. On failure the previous snapshot is
    /// left untouched.
    pub fn refresh(&mut self) -> Result<()> {
        let pids = self.source.list_pids()?;

        let mut processes = BTreeMap::new();
        let mut degraded = 0usize;
        for pid in pids {
            let identity = self.source.identify(pid);
            if identity.access != AccessLevel::Full {
                degraded += 1;
            }
            processes.insert(pid, ProcessRecord::new(pid, identity.name, identity.path));
        }

        log::debug!(
            "Process refresh via {}: {} processes ({} with reduced access)",
            self.source.name(),
            processes.len(),
            degraded
        );
        self.processes = processes;
        Ok(())
    }

    /// Snapshot in ascending pid order
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.processes.values().cloned().collect()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// In the last snapshot, or started since and still running
    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid) || self.source.is_alive(pid)
    }

    pub fn live_pids(&self) -> HashSet<u32> {
        self.processes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
