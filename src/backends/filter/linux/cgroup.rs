//! Per-process cgroup v2 membership for nftables socket matching.
//!
//! # How it works
//!
//! 1. Remember the process's current cgroup from `/proc/<pid>/cgroup`
//! 2. Create `/sys/fs/cgroup/<name>/pid_<pid>` and write the pid to `cgroup.procs`
//! 3. nftables matches with `socket cgroupv2 level 2 "<name>/pid_<pid>"`
//! 4. On release, write the pid back into its original cgroup and remove ours
//!
//! Both filters of a process share the membership, so it is refcounted.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Base path for cgroup v2 unified hierarchy
const CGROUP_V2_BASE: &str = "/sys/fs/cgroup";

struct Membership {
    /// Original cgroup, relative to the v2 root (e.g. "/user.slice/session-2.scope")
    original: Option<String>,
    refs: usize,
}

pub struct CgroupJail {
    root: PathBuf,
    name: String,
    members: HashMap<u32, Membership>,
}

impl CgroupJail {
    pub fn new(name: &str) -> Self {
        Self {
            root: PathBuf::from(CGROUP_V2_BASE),
            name: name.to_string(),
            members: HashMap::new(),
        }
    }

    /// Cgroup v2 is mounted when the root carries `cgroup.controllers`
    pub fn is_available() -> bool {
        Path::new(CGROUP_V2_BASE).join("cgroup.controllers").exists()
    }

    fn base_path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn relative_path(&self, pid: u32) -> String {
        format!("{}/pid_{}", self.name, pid)
    }

    pub fn prepare(&self) -> Result<()> {
        let base = self.base_path();
        fs::create_dir_all(&base)
            .with_context(|| format!("Failed to create base cgroup at {:?}", base))
    }

    /// Move `pid` into its own cgroup (or bump the refcount if already
    /// there). Returns the cgroup path relative to the v2 root.
    pub fn acquire(&mut self, pid: u32) -> Result<String> {
        let relative = self.relative_path(pid);

        if let Some(member) = self.members.get_mut(&pid) {
            member.refs += 1;
            return Ok(relative);
        }

        let original = fs::read_to_string(format!("/proc/{}/cgroup", pid))
            .ok()
            .and_then(|contents| parse_unified_cgroup(&contents));

        let cgroup_path = self.root.join(&relative);
        fs::create_dir_all(&cgroup_path)
            .with_context(|| format!("Failed to create cgroup at {:?}", cgroup_path))?;

        let procs_file = cgroup_path.join("cgroup.procs");
        if let Err(e) = fs::write(&procs_file, pid.to_string()) {
            let _ = fs::remove_dir(&cgroup_path);
            return Err(e).with_context(|| format!("Failed to add PID {} to cgroup", pid));
        }

        log::debug!(
            "Moved PID {} from {:?} into cgroup {}",
            pid,
            original.as_deref().unwrap_or("?"),
            relative
        );
        self.members.insert(pid, Membership { original, refs: 1 });
        Ok(relative)
    }

    /// Drop one reference; the last one restores the original cgroup.
    pub fn release(&mut self, pid: u32) -> Result<()> {
        let Some(member) = self.members.get_mut(&pid) else {
            return Ok(());
        };
        member.refs -= 1;
        if member.refs > 0 {
            return Ok(());
        }

        let original = self.members.remove(&pid).and_then(|m| m.original);
        self.restore(pid, original.as_deref())
    }

    fn restore(&self, pid: u32, original: Option<&str>) -> Result<()> {
        if let Some(original) = original {
            let procs_file = self
                .root
                .join(original.trim_start_matches('/'))
                .join("cgroup.procs");
            match fs::write(&procs_file, pid.to_string()) {
                Ok(()) => log::debug!("Restored PID {} to cgroup {}", pid, original),
                // Process already exited
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => log::warn!("Failed to restore PID {} to {}: {}", pid, original, e),
            }
        }

        let cgroup_path = self.root.join(self.relative_path(pid));
        match fs::remove_dir(&cgroup_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove cgroup directory {:?}", cgroup_path))
            }
        }
    }

    /// Release every membership and remove the base cgroup
    pub fn teardown(&mut self) {
        let pids: Vec<u32> = self.members.keys().copied().collect();
        for pid in pids {
            let original = self.members.remove(&pid).and_then(|m| m.original);
            if let Err(e) = self.restore(pid, original.as_deref()) {
                log::warn!("{:#}", e);
            }
        }

        let base = self.base_path();
        if let Err(e) = fs::remove_dir(&base) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove base cgroup {:?}: {}", base, e);
            }
        }
    }
}

/// The unified hierarchy entry of `/proc/<pid>/cgroup` is `0::<path>`
fn parse_unified_cgroup(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}
