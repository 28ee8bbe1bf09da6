//! Portable fallback probe, built on the `sysinfo` crate.
//!
//! Hosts without a scoped child-enumeration primitive pay O(all
//! processes) per monitoring tick here, because `sysinfo` only offers the
//! flat process table.  That is a cost caveat, not a correctness issue:
//! the walker's results are the same either way.

use crate::{HostMemory, Mib, Pid, SystemProbe};

use std::sync::Mutex;

use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

/// The portable probe.
///
/// Holds a [`sysinfo::System`] behind a mutex; each query refreshes the
/// smallest slice of it that `sysinfo` permits.
#[derive(Debug)]
pub struct SysinfoProbe {
    /// The `sysinfo` handle.  Refreshed in place to avoid re-allocating
    /// the process table every tick.
    system: Mutex<System>,
}

impl SysinfoProbe {
    /// Make a new `SysinfoProbe`.
    pub fn new() -> Self {
        SysinfoProbe {
            system: Mutex::new(System::new()),
        }
    }

    /// Run `f` with the process entry for `pid` freshly refreshed.
    fn with_process<T>(&self, pid: Pid, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut sys = self.system.lock().ok()?;
        let target = sysinfo::Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).map(f)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        SysinfoProbe::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn host_memory(&self) -> Option<HostMemory> {
        let mut sys = self.system.lock().ok()?;
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            // sysinfo reports zeroes on platforms it cannot read.
            debug!("host memory unreadable here; admission will not gate");
            return None;
        }
        Some(HostMemory {
            avail: Mib::from_bytes(sys.available_memory()),
            total: Mib::from_bytes(total),
        })
    }

    fn rss_mib(&self, pid: Pid) -> Option<Mib> {
        self.with_process(pid, |p| Mib::from_bytes(p.memory()))
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.with_process(pid, |p| p.parent().map(|pp| pp.as_u32()))?
    }

    fn children_of(&self, pid: Pid) -> Vec<Pid> {
        let Ok(mut sys) = self.system.lock() else {
            return Vec::new();
        };
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let parent = sysinfo::Pid::from_u32(pid);
        sys.processes()
            .iter()
            .filter(|(_, proc_)| proc_.parent() == Some(parent))
            .map(|(child, _)| child.as_u32())
            .collect()
    }

    fn cmdline(&self, pid: Pid) -> Option<Vec<String>> {
        let args = self.with_process(pid, |p| {
            p.cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })?;
        if args.is_empty() { None } else { Some(args) }
    }
}
