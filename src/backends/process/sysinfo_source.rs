// Portable process source backed by sysinfo

use super::{AccessLevel, ProcessIdentity, ProcessSource};
use anyhow::Result;
use std::sync::Mutex;
use sysinfo::{Pid, System};

pub struct SysinfoProcessSource {
    // Refreshed by list_pids, read by identify
    system: Mutex<System>,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
        }
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn list_pids(&self) -> Result<Vec<u32>> {
        let mut sys = self
            .system
            .lock()
            .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
        *sys = System::new_all();
        Ok(sys.processes().keys().map(|pid| pid.as_u32()).collect())
    }

    fn identify(&self, pid: u32) -> ProcessIdentity {
        let Ok(sys) = self.system.lock() else {
            return ProcessIdentity::pid_only();
        };

        let Some(process) = sys.process(Pid::from_u32(pid)) else {
            return ProcessIdentity::pid_only();
        };

        let name = process.name().to_string_lossy().into_owned();
        match process.exe() {
            Some(path) => ProcessIdentity {
                name,
                path: path.to_string_lossy().into_owned(),
                access: AccessLevel::Full,
            },
            None if !name.is_empty() => ProcessIdentity {
                name,
                path: String::new(),
                access: AccessLevel::Limited,
            },
            None => ProcessIdentity::pid_only(),
        }
    }
}
