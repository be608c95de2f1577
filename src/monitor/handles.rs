//! Best-effort detection of files another process still has open for writing.
//!
//! A false negative only costs one more stability window; it never causes a partial import,
//! because the size check still applies.

use std::fs;
use std::path::{Path, PathBuf};

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// Answers whether some process currently holds `path` open for writing.
pub trait OpenHandleDetector: Send + Sync {
    fn is_open_for_writing(&self, path: &Path) -> bool;
}

impl<F> OpenHandleDetector for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_open_for_writing(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Never reports a file as open.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverOpen;

impl OpenHandleDetector for NeverOpen {
    fn is_open_for_writing(&self, _path: &Path) -> bool {
        false
    }
}

/// Scans the host process table.
///
/// Processes are enumerated with `sysinfo`; each one's descriptor table is read from
/// `/proc/<pid>/fd`, so detection only works on Linux and reports `false` elsewhere.
/// Processes we may not inspect are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTableDetector;

impl ProcessTableDetector {
    pub fn new() -> Self {
        Self
    }
}

impl OpenHandleDetector for ProcessTableDetector {
    fn is_open_for_writing(&self, path: &Path) -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        let Ok(target) = fs::canonicalize(path) else {
            return false;
        };

        // Only the process list is needed, not CPU or memory figures.
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        let own = std::process::id();
        system
            .processes()
            .keys()
            .map(|pid| pid.as_u32())
            .filter(|pid| *pid != own)
            .any(|pid| holds_for_writing(pid, &target))
    }
}

fn holds_for_writing(pid: u32, target: &Path) -> bool {
    let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
    let Ok(entries) = fs::read_dir(&fd_dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let Ok(link) = fs::read_link(entry.path()) else {
            return false;
        };
        if link != target {
            return false;
        }
        let fdinfo = PathBuf::from(format!("/proc/{pid}/fdinfo")).join(entry.file_name());
        // Unknown access mode counts as writable.
        fs::read_to_string(fdinfo)
            .ok()
            .and_then(|info| access_mode(&info))
            .is_none_or(|mode| mode != 0)
    })
}

/// `O_ACCMODE` bits of the `flags:` line in a `/proc/<pid>/fdinfo/<fd>` entry.
fn access_mode(fdinfo: &str) -> Option<u32> {
    fdinfo
        .lines()
        .find_map(|l| l.strip_prefix("flags:"))
        .and_then(|flags| u32::from_str_radix(flags.trim(), 8).ok())
        .map(|flags| flags & 0o3)
}
