// Windows process source using sysinfo for enumeration and Win32 for identity
//
// Identity degrades the same way Task Manager does: try full query rights,
// then limited query rights, then report the bare pid.

use super::{AccessLevel, ProcessIdentity, ProcessSource};
use anyhow::Result;
use sysinfo::System;
use windows::Win32::Foundation::{CloseHandle, HANDLE, MAX_PATH};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ, QueryFullProcessImageNameW,
};

pub struct WindowsProcessSource;

impl WindowsProcessSource {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSource for WindowsProcessSource {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn list_pids(&self) -> Result<Vec<u32>> {
        let sys = System::new_all();
        Ok(sys.processes().keys().map(|pid| pid.as_u32()).collect())
    }

    fn identify(&self, pid: u32) -> ProcessIdentity {
        // SAFETY: OpenProcess is safe with valid parameters
        let full = unsafe {
            OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
        };
        if let Ok(handle) = full {
            return identity_from_handle(handle, AccessLevel::Full);
        }

        // SAFETY: OpenProcess is safe with valid parameters
        let limited = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) };
        match limited {
            Ok(handle) => identity_from_handle(handle, AccessLevel::Limited),
            Err(e) => {
                log::trace!("PID {} not accessible: {}", pid, e);
                ProcessIdentity::pid_only()
            }
        }
    }
}

/// Query the image path through an open handle and close it.
fn identity_from_handle(handle: HANDLE, access: AccessLevel) -> ProcessIdentity {
    let mut buffer = [0u16; MAX_PATH as usize];
    let mut size = buffer.len() as u32;

    // SAFETY: QueryFullProcessImageNameW is safe with valid handle and buffer
    let result = unsafe {
        QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            windows::core::PWSTR(buffer.as_mut_ptr()),
            &mut size,
        )
    };

    unsafe {
        let _ = CloseHandle(handle);
    }

    if result.is_err() || size == 0 {
        return ProcessIdentity {
            name: String::new(),
            path: String::new(),
            access,
        };
    }

    let path = String::from_utf16_lossy(&buffer[..size as usize]);
    let name = std::path::Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    ProcessIdentity { name, path, access }
}
