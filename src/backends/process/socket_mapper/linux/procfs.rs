// Linux procfs-based socket mapper

use super::super::{ConnectionTable, SocketOwner};
use crate::backends::BackendPriority;
use crate::flow::Protocol;
use anyhow::{Context, Result};
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;

/// Socket mapper using Linux /proc filesystem
///
/// This backend reads socket information from:
/// - /proc/[pid]/fd/ - for socket inodes
/// - /proc/net/tcp, /proc/net/tcp6 - for TCP connections
/// - /proc/net/udp, /proc/net/udp6 - for UDP sockets
///
/// Sockets whose inode is not held by any readable process (other users'
/// processes without privileges, TIME_WAIT remnants) are left out.
pub struct ProcfsSocketMapper;

impl ProcfsSocketMapper {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    /// Build socket inode -> PID map by scanning all processes
    fn inode_owners(&self) -> Result<HashMap<u64, u32>> {
        let mut socket_to_pid = HashMap::new();

        let all_procs = all_processes().context("Failed to enumerate /proc")?;
        for proc_result in all_procs {
            let Ok(process) = proc_result else { continue };
            let pid = process.pid() as u32;

            if let Ok(fds) = process.fd() {
                for fd_result in fds {
                    if let Ok(fd_info) = fd_result {
                        if let FDTarget::Socket(inode) = fd_info.target {
                            socket_to_pid.insert(inode, pid);
                        }
                    }
                }
            }
        }

        Ok(socket_to_pid)
    }
}

impl ConnectionTable for ProcfsSocketMapper {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn priority() -> BackendPriority {
        BackendPriority::Best // Native Linux API, always available, fast
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn socket_owners(&self) -> Result<Vec<SocketOwner>> {
        let socket_to_pid = self.inode_owners()?;
        let mut owners = Vec::new();

        let mut push = |protocol, local, remote, inode: u64| {
            if inode == 0 {
                return;
            }
            if let Some(&pid) = socket_to_pid.get(&inode) {
                owners.push(SocketOwner::new(protocol, local, remote, pid));
            }
        };

        // Missing tables (e.g. IPv6 disabled) are skipped, not fatal
        if let Ok(entries) = procfs::net::tcp() {
            for entry in entries {
                push(Protocol::Tcp, entry.local_address, entry.remote_address, entry.inode);
            }
        }
        if let Ok(entries) = procfs::net::tcp6() {
            for entry in entries {
                push(Protocol::Tcp, entry.local_address, entry.remote_address, entry.inode);
            }
        }
        if let Ok(entries) = procfs::net::udp() {
            for entry in entries {
                push(Protocol::Udp, entry.local_address, entry.remote_address, entry.inode);
            }
        }
        if let Ok(entries) = procfs::net::udp6() {
            for entry in entries {
                push(Protocol::Udp, entry.local_address, entry.remote_address, entry.inode);
            }
        }

        log::trace!("procfs connection table: {} owned sockets", owners.len());
        Ok(owners)
    }
}
