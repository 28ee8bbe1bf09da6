#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // the flagged drops are deliberate
#![allow(clippy::result_large_err)] // our error types are cold-path only
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)] // elision here would hurt readability
#![allow(mismatched_lifetime_syntaxes)] // pending lint stabilization
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod mib;
mod procfs;
mod sysinfo_probe;

#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod mock;

pub use mib::{InvalidMib, Mib};
pub use procfs::ProcfsProbe;
pub use sysinfo_probe::SysinfoProbe;

use std::sync::Arc;

/// A process id, as the operating system reports it.
///
/// Zero is never a real process; the accounting region uses it as the
/// free-slot marker.
pub type Pid = u32;

/// A snapshot of host memory, in MiB.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)] // two fields are the whole story
pub struct HostMemory {
    /// Memory available for new allocations without swapping
    pub avail: Mib,
    /// Total installed memory
    pub total: Mib,
}

impl HostMemory {
    /// Percentage of total memory currently in use, `0..=100`.
    pub fn used_percent(&self) -> u64 {
        let total = self.total.as_u64();
        if total == 0 {
            return 0;
        }
        let used = self.total.saturating_sub(self.avail).as_u64();
        used.saturating_mul(100) / total
    }
}

/// The capability set the admission core needs from the operating system.
///
/// Implementations must not block, and must treat a process vanishing
/// mid-read as "gone" (`None` / empty), never as an error: the process
/// table is racy by nature and the caller's next tick corrects any
/// stale view.
pub trait SystemProbe: std::fmt::Debug + Send + Sync + 'static {
    /// Sample host memory.
    ///
    /// `None` means this host cannot cheaply report free memory; callers
    /// degrade to admitting everything and hiding the display.
    ///
    /// Must be callable every 100 ms without imposing measurable load.
    fn host_memory(&self) -> Option<HostMemory>;

    /// Resident set size of `pid`, or `None` if the process is gone.
    fn rss_mib(&self, pid: Pid) -> Option<Mib>;

    /// Parent process of `pid`, or `None` if the process is gone.
    fn parent_of(&self, pid: Pid) -> Option<Pid>;

    /// Direct children of `pid`.
    ///
    /// A gone process simply has no children.  Implementations should
    /// scope this query to `pid` where the host allows, so that walking a
    /// process tree costs O(live descendants) per tick.
    fn children_of(&self, pid: Pid) -> Vec<Pid>;

    /// Command line of `pid`, one token per argument, or `None` if the
    /// process is gone (or its arguments are unreadable).
    fn cmdline(&self, pid: Pid) -> Option<Vec<String>>;
}

/// Construct the preferred probe for this host.
///
/// Linux gets the scoped `/proc` probe; everything else gets the portable
/// flat-enumeration fallback.
pub fn default_probe() -> Arc<dyn SystemProbe> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Arc::new(ProcfsProbe::new())
        } else {
            Arc::new(SysinfoProbe::new())
        }
    }
}
