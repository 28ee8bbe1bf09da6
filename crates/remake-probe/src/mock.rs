//! A scriptable probe for tests.
//!
//! Tests build a little process tree, hand the probe to the code under
//! test, and then mutate the tree between ticks: grow a process's RSS,
//! make it exit, change the host's free memory, or declare the host
//! unable to report memory at all.
//!
//! Clones share state, so a test can keep one handle while the code under
//! test owns another.

#![allow(clippy::missing_docs_in_private_items)]

use crate::{HostMemory, Mib, Pid, SystemProbe};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One simulated process.
#[derive(Debug, Clone)]
struct MockProcess {
    parent: Pid,
    rss: Mib,
    cmdline: Option<Vec<String>>,
}

/// Shared state of a [`MockProbe`] and its clones.
#[derive(Debug, Default)]
struct MockState {
    host: Option<HostMemory>,
    procs: HashMap<Pid, MockProcess>,
}

/// A probe whose world is entirely under the test's control.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    /// Shared mutable world.
    state: Arc<Mutex<MockState>>,
}

impl MockProbe {
    /// A probe with no processes and unknown host memory.
    pub fn new() -> Self {
        MockProbe::default()
    }

    /// A probe with the given host memory and no processes.
    pub fn with_memory(avail: Mib, total: Mib) -> Self {
        let probe = MockProbe::new();
        probe.set_host_memory(Some(HostMemory { avail, total }));
        probe
    }

    /// Lock the shared state.
    ///
    /// The lock is never poisoned in practice; tests that panic while
    /// holding it are already failing.
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock probe poisoned")
    }

    /// Set (or clear, with `None`) the host memory snapshot.
    pub fn set_host_memory(&self, host: Option<HostMemory>) {
        self.lock().host = host;
    }

    /// Adjust just the available-memory figure.
    ///
    /// # Panics
    ///
    /// Panics if the host memory is currently unknown.
    pub fn set_avail(&self, avail: Mib) {
        let mut state = self.lock();
        let host = state.host.as_mut().expect("host memory unknown");
        host.avail = avail;
    }

    /// Add (or replace) a process.
    pub fn add_process(&self, pid: Pid, parent: Pid, rss: Mib, cmdline: Option<&[&str]>) {
        let cmdline = cmdline.map(|c| c.iter().map(|s| (*s).to_owned()).collect());
        self.lock().procs.insert(
            pid,
            MockProcess {
                parent,
                rss,
                cmdline,
            },
        );
    }

    /// Change a live process's RSS.
    pub fn set_rss(&self, pid: Pid, rss: Mib) {
        if let Some(p) = self.lock().procs.get_mut(&pid) {
            p.rss = rss;
        }
    }

    /// Remove a process, as if it had exited.
    pub fn remove_process(&self, pid: Pid) {
        self.lock().procs.remove(&pid);
    }
}

impl SystemProbe for MockProbe {
    fn host_memory(&self) -> Option<HostMemory> {
        self.lock().host
    }

    fn rss_mib(&self, pid: Pid) -> Option<Mib> {
        self.lock().procs.get(&pid).map(|p| p.rss)
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.lock().procs.get(&pid).map(|p| p.parent)
    }

    fn children_of(&self, pid: Pid) -> Vec<Pid> {
        let state = self.lock();
        let mut out: Vec<Pid> = state
            .procs
            .iter()
            .filter(|(_, p)| p.parent == pid)
            .map(|(child, _)| *child)
            .collect();
        // Deterministic order, for tests that care about discovery order.
        out.sort_unstable();
        out
    }

    fn cmdline(&self, pid: Pid) -> Option<Vec<String>> {
        self.lock().procs.get(&pid).and_then(|p| p.cmdline.clone())
    }
}
