// Linux socket mapper backends

mod procfs;

pub use procfs::ProcfsSocketMapper;

use super::{ConnectionTable, NullConnectionTable};
use crate::backends::BackendInfo;
use anyhow::Result;

/// Detect all available socket mapper backends on Linux
pub fn detect_connection_tables() -> Vec<BackendInfo> {
    vec![
        BackendInfo {
            name: "procfs",
            priority: ProcfsSocketMapper::priority(),
            available: ProcfsSocketMapper::is_available(),
        },
        BackendInfo {
            name: "none",
            priority: NullConnectionTable::priority(),
            available: true,
        },
    ]
}

/// Select socket mapper backend for Linux
///
/// Auto-selection prefers procfs and falls back to the empty table, which
/// leaves every flow unresolved.
pub fn select_connection_table(preference: Option<&str>) -> Result<Box<dyn ConnectionTable>> {
    if let Some(name) = preference {
        match name {
            "procfs" => Ok(Box::new(ProcfsSocketMapper::new()?)),
            "none" => Ok(Box::new(NullConnectionTable)),
            _ => Err(anyhow::anyhow!("Unknown socket mapper: {}", name)),
        }
    } else if ProcfsSocketMapper::is_available() {
        Ok(Box::new(ProcfsSocketMapper::new()?))
    } else {
        log::warn!("/proc/net not readable, flows will not be attributed");
        Ok(Box::new(NullConnectionTable))
    }
}
