// Linux filter backend: nftables rules + NFQUEUE userspace shaping
//
// Session = a private nftables table. Each filter = one rule sending a
// process's cgroup traffic in one direction to a dedicated NFQUEUE, plus a
// reader thread pacing every queued packet through the filter's shaping point.
//
// The kernel stamps a socket with its cgroup when the socket is created, so
// sockets opened before the process was moved never match the cgroup rule.
// Those are caught by per-protocol local port rules feeding the same queue,
// refreshed through `track_ports`.

mod cgroup;
mod nfqueue;
mod nft;

use super::{FilterBackend, FilterHandle, FilterSettings};
use crate::backends::BackendPriority;
use crate::budget::ShapingPoint;
use crate::flow::{Direction, LocalPorts, Protocol};
use anyhow::{Result, anyhow};
use cgroup::CgroupJail;
use nfqueue::QueueReader;
use nft::NftTable;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

struct InstalledFilter {
    pid: u32,
    direction: Direction,
    rule_handle: u64,
    reader: QueueReader,
    ports: LocalPorts,
    port_rules: Vec<u64>,
}

pub struct NfqueueBackend {
    settings: FilterSettings,
    table: NftTable,
    cgroups: CgroupJail,
    session_open: bool,
    next_handle: u64,
    next_queue_offset: u16,
    filters: HashMap<FilterHandle, InstalledFilter>,
    // Readers of removed filters still flushing their queues
    draining: Vec<QueueReader>,
}

impl NfqueueBackend {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            table: NftTable::new(&settings.nft_table),
            cgroups: CgroupJail::new(&settings.cgroup_name),
            settings,
            session_open: false,
            next_handle: 1,
            next_queue_offset: 0,
            filters: HashMap::new(),
            draining: Vec::new(),
        }
    }

    /// Next queue number not bound by a live or draining reader
    fn allocate_queue(&mut self) -> u16 {
        let filters = &self.filters;
        let draining = &self.draining;
        next_free_queue(
            self.settings.queue_base,
            &mut self.next_queue_offset,
            |num| {
                filters.values().any(|f| f.reader.queue_num() == num)
                    || draining.iter().any(|r| r.queue_num() == num)
            },
        )
    }

    fn delete_port_rules(&self, direction: Direction, rules: &[u64]) {
        for &rule in rules {
            if let Err(e) = self.table.delete_rule(direction, rule) {
                log::warn!("Failed to delete port rule {}: {:#}", rule, e);
            }
        }
    }

    fn reap_draining(&mut self) {
        let (finished, pending): (Vec<_>, Vec<_>) =
            self.draining.drain(..).partition(|r| r.is_finished());
        for reader in finished {
            reader.join();
        }
        self.draining = pending;
    }

    fn release_cgroup(&mut self, pid: u32) {
        if let Err(e) = self.cgroups.release(pid) {
            log::warn!("Failed to release cgroup of PID {}: {:#}", pid, e);
        }
    }
}

impl FilterBackend for NfqueueBackend {
    fn name(&self) -> &'static str {
        "nfqueue"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        NftTable::is_available() && CgroupJail::is_available()
    }

    fn open(&mut self) -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            return Err(anyhow::Error::new(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "root privileges required for nftables and cgroups",
            )));
        }
        if !CgroupJail::is_available() {
            return Err(anyhow!("cgroup v2 unified hierarchy not mounted at /sys/fs/cgroup"));
        }
        if !NftTable::is_available() {
            return Err(anyhow!("nft binary not found; install the nftables package"));
        }

        self.cgroups.prepare()?;
        self.table.create()?;
        self.session_open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let handles: Vec<FilterHandle> = self.filters.keys().copied().collect();
        for handle in handles {
            let _ = self.remove(handle);
        }

        let result = self.table.destroy();
        for reader in self.draining.drain(..) {
            reader.join();
        }
        self.cgroups.teardown();
        self.session_open = false;
        result
    }

    fn install(
        &mut self,
        pid: u32,
        direction: Direction,
        point: Arc<ShapingPoint>,
    ) -> Result<FilterHandle> {
        if !self.session_open {
            return Err(anyhow!("nfqueue session is not open"));
        }
        self.reap_draining();

        let cgroup_path = self.cgroups.acquire(pid)?;
        let queue_num = self.allocate_queue();

        // Bind before the rule exists so no packet hits an unbound queue
        let reader = match QueueReader::spawn(queue_num, self.settings.queue_max_len, point) {
            Ok(reader) => reader,
            Err(e) => {
                self.release_cgroup(pid);
                return Err(e);
            }
        };

        let rule_handle = match self.table.add_queue_rule(direction, &cgroup_path, queue_num) {
            Ok(handle) => handle,
            Err(e) => {
                reader.retire();
                self.draining.push(reader);
                self.release_cgroup(pid);
                return Err(e);
            }
        };

        let handle = FilterHandle::new(self.next_handle);
        self.next_handle += 1;
        self.filters.insert(
            handle,
            InstalledFilter {
                pid,
                direction,
                rule_handle,
                reader,
                ports: LocalPorts::default(),
                port_rules: Vec::new(),
            },
        );

        log::info!(
            "Queued {} traffic of PID {} to NFQUEUE {} (rule {})",
            direction,
            pid,
            queue_num,
            rule_handle
        );
        Ok(handle)
    }

    fn track_ports(&mut self, handle: FilterHandle, ports: &LocalPorts) -> Result<()> {
        let filter = self
            .filters
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("nfqueue filter {} not installed", handle))?;
        if filter.ports == *ports {
            return Ok(());
        }

        let queue_num = filter.reader.queue_num();
        let mut added = Vec::new();
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            let set = ports.get(protocol);
            if set.is_empty() {
                continue;
            }
            match self
                .table
                .add_port_rule(filter.direction, protocol, set, queue_num)
            {
                Ok(rule) => added.push(rule),
                Err(e) => {
                    for rule in added {
                        let _ = self.table.delete_rule(filter.direction, rule);
                    }
                    return Err(e);
                }
            }
        }

        // New rules go in before the old ones leave, so a port kept across
        // refreshes is never briefly unshaped
        let stale = std::mem::replace(&mut filter.port_rules, added);
        filter.ports = ports.clone();
        let (direction, pid) = (filter.direction, filter.pid);
        self.delete_port_rules(direction, &stale);

        log::debug!(
            "{} filter of PID {} tracks {} existing local ports",
            direction,
            pid,
            ports.len()
        );
        Ok(())
    }

    fn remove(&mut self, handle: FilterHandle) -> Result<()> {
        let filter = self
            .filters
            .remove(&handle)
            .ok_or_else(|| anyhow!("nfqueue filter {} not installed", handle))?;

        // Rules first: new packets bypass the queue from here on
        self.delete_port_rules(filter.direction, &filter.port_rules);
        let result = self.table.delete_rule(filter.direction, filter.rule_handle);

        filter.reader.retire();
        self.draining.push(filter.reader);
        self.release_cgroup(filter.pid);
        self.reap_draining();

        log::info!(
            "Removed {} filter of PID {} (rule {})",
            filter.direction,
            filter.pid,
            filter.rule_handle
        );
        result
    }
}

impl Drop for NfqueueBackend {
    fn drop(&mut self) {
        if self.session_open {
            let _ = self.close();
        }
    }
}

/// Walk queue numbers from `base + offset`, wrapping, until one is free.
/// Advances `offset` past the returned number.
fn next_free_queue<F>(base: u16, offset: &mut u16, in_use: F) -> u16
where
    F: Fn(u16) -> bool,
{
    loop {
        let num = base.wrapping_add(*offset);
        *offset = offset.wrapping_add(1);
        if !in_use(num) {
            return num;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_backend_hands_out_consecutive_queues() {
        let mut backend = NfqueueBackend::new(FilterSettings::default());
        assert_eq!(backend.allocate_queue(), 7100);
        assert_eq!(backend.allocate_queue(), 7101);
        assert_eq!(backend.allocate_queue(), 7102);
    }

    #[test]
    fn test_busy_queues_are_skipped() {
        let busy = [7100u16, 7101, 7103];
        let mut offset = 0;

        assert_eq!(next_free_queue(7100, &mut offset, |n| busy.contains(&n)), 7102);
        assert_eq!(next_free_queue(7100, &mut offset, |n| busy.contains(&n)), 7104);
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_queue_numbers_wrap_around() {
        let mut offset = 1;
        assert_eq!(next_free_queue(u16::MAX, &mut offset, |_| false), 0);
        assert_eq!(next_free_queue(u16::MAX, &mut offset, |n| n == 1), 2);
    }
}

