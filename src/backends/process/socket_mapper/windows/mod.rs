// Windows socket-to-PID mapping backends
//
// This module provides Windows-specific socket mapping implementations
// using GetExtendedTcpTable/GetExtendedUdpTable APIs from IP Helper.

mod iphelper;

pub use iphelper::IpHelperSocketMapper;

use super::{ConnectionTable, NullConnectionTable};
use crate::backends::BackendInfo;
use anyhow::Result;

/// Detect available socket mapper backends on Windows
pub fn detect_connection_tables() -> Vec<BackendInfo> {
    vec![
        BackendInfo {
            name: "iphelper",
            priority: IpHelperSocketMapper::priority(),
            available: IpHelperSocketMapper::is_available(),
        },
        BackendInfo {
            name: "none",
            priority: NullConnectionTable::priority(),
            available: true,
        },
    ]
}

/// Select socket mapper backend for Windows
pub fn select_connection_table(preference: Option<&str>) -> Result<Box<dyn ConnectionTable>> {
    match preference {
        Some("iphelper") | None => Ok(Box::new(IpHelperSocketMapper::new()?)),
        Some("none") => Ok(Box::new(NullConnectionTable)),
        Some(name) => Err(anyhow::anyhow!("Unknown socket mapper: {}", name)),
    }
}
