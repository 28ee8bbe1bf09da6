//! Linux probe, reading the `/proc` filesystem directly.
//!
//! All reads are single small files; a read that fails for any reason is
//! reported as "gone" or "unknown" rather than as an error, because the
//! usual cause is the process exiting between our directory scan and our
//! open.

use crate::{HostMemory, Mib, Pid, SystemProbe};

use std::fs;
use std::path::PathBuf;

/// The scoped Linux `/proc` probe.
///
/// Stateless; every operation is a fresh read of the relevant `/proc`
/// file.  Child enumeration uses `/proc/<pid>/task/<tid>/children`, which
/// the kernel maintains per process, so walking a build's descendants
/// never touches the global process table.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ProcfsProbe {}

impl ProcfsProbe {
    /// Make a new `ProcfsProbe`.
    pub fn new() -> Self {
        ProcfsProbe::default()
    }

    /// Fetch one `<key>: <value> kB`-style field from `/proc/<pid>/status`.
    ///
    /// Returns the numeric portion of the value.
    fn status_field(pid: Pid, key: &str) -> Option<u64> {
        let text = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_keyed_field(&text, key)
    }
}

/// Find `<key>:` in a `/proc` key-value file and parse its first numeric
/// token.
///
/// The `kB` suffix, where present, is left to the caller's choice of unit
/// conversion.
fn parse_keyed_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|tok| tok.parse().ok())
}

impl SystemProbe for ProcfsProbe {
    fn host_memory(&self) -> Option<HostMemory> {
        let text = fs::read_to_string("/proc/meminfo").ok()?;
        let total = parse_keyed_field(&text, "MemTotal")?;
        let avail = parse_keyed_field(&text, "MemAvailable")?;
        Some(HostMemory {
            avail: Mib::from_kib(avail),
            total: Mib::from_kib(total),
        })
    }

    fn rss_mib(&self, pid: Pid) -> Option<Mib> {
        // A kernel thread (or a zombie) has no VmRSS line; report it as
        // using nothing rather than as gone, since the pid is still live.
        let text = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        Some(Mib::from_kib(parse_keyed_field(&text, "VmRSS").unwrap_or(0)))
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        let ppid = Self::status_field(pid, "PPid")?;
        u32::try_from(ppid).ok()
    }

    fn children_of(&self, pid: Pid) -> Vec<Pid> {
        // Each thread has its own children file; a multithreaded runner
        // can fork from any of them.
        let mut out = Vec::new();
        let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
        let Ok(tasks) = fs::read_dir(task_dir) else {
            return out;
        };
        for task in tasks.flatten() {
            let Ok(text) = fs::read_to_string(task.path().join("children")) else {
                continue;
            };
            out.extend(text.split_whitespace().filter_map(|t| t.parse::<Pid>().ok()));
        }
        out
    }

    fn cmdline(&self, pid: Pid) -> Option<Vec<String>> {
        let bytes = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
        if bytes.is_empty() {
            // Kernel threads have an empty cmdline; nothing to classify.
            return None;
        }
        Some(
            bytes
                .split(|b| *b == 0)
                .filter(|tok| !tok.is_empty())
                .map(|tok| String::from_utf8_lossy(tok).into_owned())
                .collect(),
        )
    }
}
