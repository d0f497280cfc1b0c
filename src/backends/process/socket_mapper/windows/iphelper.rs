// Windows IP Helper API-based socket mapper
//
// This backend uses Windows IP Helper API (iphlpapi.dll) to enumerate
// TCP and UDP connections with their owning process IDs.

use crate::backends::process::socket_mapper::{ConnectionTable, SocketOwner};
use crate::backends::BackendPriority;
use crate::flow::Protocol;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use windows::Win32::Foundation::NO_ERROR;
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCP6TABLE_OWNER_PID, MIB_TCPTABLE_OWNER_PID,
    MIB_UDP6TABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

/// Socket mapper using Windows IP Helper API
///
/// This is the standard Windows approach for socket-to-PID mapping
/// (used by netstat, Task Manager, etc.)
pub struct IpHelperSocketMapper;

impl IpHelperSocketMapper {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("IP Helper API not available");
        }
        Ok(Self)
    }
}

impl ConnectionTable for IpHelperSocketMapper {
    fn name(&self) -> &'static str {
        "iphelper"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Best // Native Windows API
    }

    fn is_available() -> bool {
        cfg!(target_os = "windows")
    }

    fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
        let mut owners = Vec::new();

        match tcp_rows(AF_INET.0 as u32) {
            Ok(rows) => owners.extend(rows),
            Err(e) => log::debug!("TCP table unavailable: {}", e),
        }
        match tcp_rows(AF_INET6.0 as u32) {
            Ok(rows) => owners.extend(rows),
            Err(e) => log::debug!("TCP6 table unavailable: {}", e),
        }
        match udp_rows(AF_INET.0 as u32) {
            Ok(rows) => owners.extend(rows),
            Err(e) => log::debug!("UDP table unavailable: {}", e),
        }
        match udp_rows(AF_INET6.0 as u32) {
            Ok(rows) => owners.extend(rows),
            Err(e) => log::debug!("UDP6 table unavailable: {}", e),
        }

        Ok(owners)
    }
}

/// Ports are stored in network byte order in the low 16 bits
fn port_from_dword(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

fn tcp_rows(family: u32) -> Result<Vec<SocketOwner>> {
    let buffer = fetch_table(|buf, size| unsafe {
        GetExtendedTcpTable(buf, size, false, family, TCP_TABLE_OWNER_PID_ALL, 0)
    })?;
    let Some(buffer) = buffer else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    unsafe {
        if family == AF_INET.0 as u32 {
            let table = &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
            let entries =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            for row in entries {
                let local = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
                    port_from_dword(row.dwLocalPort),
                );
                let remote = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwRemoteAddr))),
                    port_from_dword(row.dwRemotePort),
                );
                rows.push(SocketOwner::new(Protocol::Tcp, local, remote, row.dwOwningPid));
            }
        } else {
            let table = &*(buffer.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID);
            let entries =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            for row in entries {
                let local = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
                    port_from_dword(row.dwLocalPort),
                );
                let remote = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(row.ucRemoteAddr)),
                    port_from_dword(row.dwRemotePort),
                );
                rows.push(SocketOwner::new(Protocol::Tcp, local, remote, row.dwOwningPid));
            }
        }
    }

    Ok(rows)
}

fn udp_rows(family: u32) -> Result<Vec<SocketOwner>> {
    let buffer = fetch_table(|buf, size| unsafe {
        GetExtendedUdpTable(buf, size, false, family, UDP_TABLE_OWNER_PID, 0)
    })?;
    let Some(buffer) = buffer else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    unsafe {
        if family == AF_INET.0 as u32 {
            let table = &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
            let entries =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            for row in entries {
                let local = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
                    port_from_dword(row.dwLocalPort),
                );
                let unbound = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
                rows.push(SocketOwner::new(Protocol::Udp, local, unbound, row.dwOwningPid));
            }
        } else {
            let table = &*(buffer.as_ptr() as *const MIB_UDP6TABLE_OWNER_PID);
            let entries =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            for row in entries {
                let local = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
                    port_from_dword(row.dwLocalPort),
                );
                let unbound = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
                rows.push(SocketOwner::new(Protocol::Udp, local, unbound, row.dwOwningPid));
            }
        }
    }

    Ok(rows)
}

/// Two-call buffer dance shared by the Get*Table APIs: ask for the size,
/// then fill. Returns `None` when the table is empty.
fn fetch_table<F>(call: F) -> Result<Option<Vec<u8>>>
where
    F: Fn(Option<*mut core::ffi::c_void>, *mut u32) -> u32,
{
    let mut size: u32 = 0;
    let _ = call(None, &mut size);

    if size == 0 {
        return Ok(None);
    }

    let mut buffer = vec![0u8; size as usize];
    let result = call(Some(buffer.as_mut_ptr() as *mut _), &mut size);

    if result != NO_ERROR.0 {
        anyhow::bail!("connection table query failed with error code: {}", result);
    }

    Ok(Some(buffer))
}
