use serde::{Deserialize, Serialize};

/// A live process as presented to callers of the controller.
///
/// `name` and `path` are empty when the OS denied access to the process;
/// such processes are still listed so a throttle on them stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub path: String,

    pub download_speed: u64,   // bytes per second
    pub upload_speed: u64,     // bytes per second
    pub total_downloaded: u64, // total bytes
    pub total_uploaded: u64,   // total bytes
}

impl ProcessRecord {
    pub fn new(pid: u32, name: String, path: String) -> Self {
        Self {
            pid,
            name,
            path,
            download_speed: 0,
            upload_speed: 0,
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }

    /// Name for display, falling back to the pid when access was denied.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("PID {}", self.pid)
        } else {
            self.name.clone()
        }
    }
}

/// Configured limits of an active throttle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLimits {
    pub download_limit: u64, // bytes per second, 0 blocks
    pub upload_limit: u64,   // bytes per second, 0 blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_pid() {
        let record = ProcessRecord::new(4242, String::new(), String::new());
        assert_eq!(record.display_name(), "PID 4242");

        let named = ProcessRecord::new(1, "init".to_string(), "/sbin/init".to_string());
        assert_eq!(named.display_name(), "init");
    }
}
