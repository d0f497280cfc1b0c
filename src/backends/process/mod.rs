// Process table access for platform-specific operations
//
// This module provides a platform-agnostic interface for enumerating processes
// and resolving their identity with graceful privilege degradation.

use anyhow::Result;

/// How much of a process's identity the OS let us read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Opened with full query rights: name and full path
    Full,
    /// Only limited query rights were granted
    Limited,
    /// Access denied entirely; only the pid is known
    PidOnly,
}

/// Best-effort identity of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub name: String,
    pub path: String,
    pub access: AccessLevel,
}

impl ProcessIdentity {
    pub fn pid_only() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            access: AccessLevel::PidOnly,
        }
    }
}

/// Platform-agnostic read-only view of the OS process table
pub trait ProcessSource: Send + Sync {
    /// Backend name (e.g., "procfs", "toolhelp", "sysinfo")
    fn name(&self) -> &'static str;

    /// Enumerate the pids of all live processes
    fn list_pids(&self) -> Result<Vec<u32>>;

    /// Resolve name and path, degrading from full to limited rights to pid-only.
    /// Never fails: an inaccessible process still yields a pid-only identity.
    fn identify(&self, pid: u32) -> ProcessIdentity;

    /// Whether `pid` exists right now, independent of any snapshot.
    /// An unreadable process table counts as alive.
    fn is_alive(&self, pid: u32) -> bool {
        self.list_pids().map_or(true, |pids| pids.contains(&pid))
    }
}

// Socket mapper backend system (cross-platform)
pub mod socket_mapper;

// Platform-specific implementations
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::ProcfsProcessSource;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsProcessSource;

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
mod sysinfo_source;
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub use sysinfo_source::SysinfoProcessSource;

/// Factory function to create the platform-specific process source
pub fn create_process_source() -> Box<dyn ProcessSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsProcessSource::new())
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsProcessSource::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Box::new(SysinfoProcessSource::new())
    }
}
