// Linux process source using procfs

use super::{AccessLevel, ProcessIdentity, ProcessSource};
use anyhow::{Context, Result};
use procfs::process::{Process, all_processes};

/// Reads the process table from /proc.
///
/// Full rights means the `/proc/<pid>/exe` link is readable (same user or
/// CAP_SYS_PTRACE). Without it we fall back to the world-readable `stat`
/// command name, and finally to the bare pid.
pub struct ProcfsProcessSource;

impl ProcfsProcessSource {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSource for ProcfsProcessSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn list_pids(&self) -> Result<Vec<u32>> {
        let all_procs = all_processes().context("Failed to enumerate /proc")?;

        let mut pids = Vec::new();
        for proc_result in all_procs {
            if let Ok(process) = proc_result {
                pids.push(process.pid() as u32);
            }
        }

        Ok(pids)
    }

    fn identify(&self, pid: u32) -> ProcessIdentity {
        let process = match Process::new(pid as i32) {
            Ok(process) => process,
            Err(_) => return ProcessIdentity::pid_only(),
        };

        match process.exe() {
            Ok(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return ProcessIdentity {
                    name,
                    path: path.to_string_lossy().into_owned(),
                    access: AccessLevel::Full,
                };
            }
            Err(e) => {
                log::trace!("PID {} exe not readable, trying stat: {}", pid, e);
            }
        }

        match process.stat() {
            Ok(stat) => ProcessIdentity {
                name: stat.comm,
                path: String::new(),
                access: AccessLevel::Limited,
            },
            Err(_) => ProcessIdentity::pid_only(),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        Process::new(pid as i32).is_ok()
    }
}
