//! `MemGuard`: the core context and its lifecycle
//!
//! One `MemGuard` per build process.  The top-level build's guard loads
//! the profile store, creates and zeroes the shared region, and runs the
//! monitor thread; at teardown it stops the monitor, flushes profiles,
//! and unlinks the region.  A sub-build's guard owns none of that: it
//! attaches to the region lazily and refuses (with a logged error, never
//! a failure) any operation that belongs to the top level.
//!
//! Construction cannot fail from the recipe runner's point of view:
//! anything that goes wrong produces a *disabled* guard whose operations
//! all answer as if memory awareness were compiled out.  The build must
//! run either way.

use crate::internal_prelude::*;

use crate::gate::{self, Admission};
use crate::monitor::{Monitor, MonitorShared};

/// The memory-admission core
///
/// See the [crate documentation](crate) for the big picture.  The three
/// calls the recipe runner makes are [`may_spawn`](MemGuard::may_spawn)
/// before each fork, [`child_exited`](MemGuard::child_exited) from its
/// reaper, and [`shutdown`](MemGuard::shutdown) (or just drop) at exit.
#[derive(Debug)]
pub struct MemGuard {
    /// `None` is the disabled guard: every operation is a cheap no-op.
    inner: Option<Inner>,
}

/// The working parts of an enabled guard
#[derive(Debug)]
struct Inner {
    /// State shared with the monitor thread (if any)
    shared: Arc<MonitorShared>,
    /// Classification rules, derived from the config once
    rules: ClassifyRules,
    /// The monitor, top level only
    monitor: Mutex<Option<Monitor>>,
    /// Our own pid: reservation owner for everything we admit
    self_pid: Pid,
}

impl MemGuard {
    /// Set up the core for this process.
    ///
    /// Never fails: a configuration that disables memory awareness, an
    /// unusable shared region, or any other startup problem yields a
    /// disabled guard (with a logged warning where that is news).
    pub fn new(config: Config, probe: Arc<dyn SystemProbe>) -> MemGuard {
        match Self::try_new(config, probe) {
            Ok(guard) => guard,
            Err(StartupError::DisabledByConfig) => {
                debug!("memory awareness is off; building without it");
                MemGuard::disabled()
            }
            Err(e) => {
                warn!("memory awareness disabled for this build: {e}");
                MemGuard::disabled()
            }
        }
    }

    /// The guard that does nothing.
    pub fn disabled() -> MemGuard {
        MemGuard { inner: None }
    }

    /// Is this guard actually doing anything?
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// The fallible construction path behind [`new`](MemGuard::new).
    fn try_new(config: Config, probe: Arc<dyn SystemProbe>) -> Result<MemGuard, StartupError> {
        if !config.enabled {
            return Err(StartupError::DisabledByConfig);
        }
        let self_pid = std::process::id();
        let rules = ClassifyRules::from_config(&config);

        let inner = match config.role {
            Role::TopLevel => {
                // Region first: if the host can't give us one, the whole
                // memory-aware path is off for this invocation.
                let region = AccountingRegion::open_shared(&config.shm_name, Role::TopLevel)?;

                let mut profiles =
                    ProfileStore::new(config.cache_file.clone(), config.decay_divisor);
                profiles.load();

                let shared = Arc::new(MonitorShared {
                    probe,
                    profiles: Mutex::new(profiles),
                    region: RegionSlot::eager(region),
                    config,
                });
                let monitor = Monitor::spawn(Arc::clone(&shared), self_pid);
                Inner {
                    shared,
                    rules,
                    monitor: Mutex::new(Some(monitor)),
                    self_pid,
                }
            }
            Role::SubBuild => {
                // Do nothing now; the region attaches on first use and
                // the profile store stays empty (the top level owns it).
                let shm_name = config.shm_name.clone();
                let profiles =
                    ProfileStore::new(config.cache_file.clone(), config.decay_divisor);
                let shared = Arc::new(MonitorShared {
                    probe,
                    profiles: Mutex::new(profiles),
                    region: RegionSlot::lazy(shm_name, Role::SubBuild),
                    config,
                });
                Inner {
                    shared,
                    rules,
                    monitor: Mutex::new(None),
                    self_pid,
                }
            }
        };
        Ok(MemGuard { inner: Some(inner) })
    }

    /// May this process spawn the child described by `argv` right now?
    ///
    /// Never blocks; on [`Wait`](Admission::Wait) the caller should retry
    /// (100 ms is a reasonable cadence).  On [`Go`](Admission::Go) with a
    /// known source profile, the predicted peak is reserved under this
    /// process's pid until [`child_exited`](MemGuard::child_exited) runs
    /// or the monitor observes the child.
    pub fn may_spawn<'t, I>(&self, argv: I) -> Admission
    where
        I: IntoIterator<Item = &'t str>,
    {
        let Some(inner) = &self.inner else {
            return Admission::Go;
        };
        let shared = &inner.shared;
        let profiles = shared.profiles();
        gate::may_spawn(
            argv,
            inner.self_pid,
            &inner.rules,
            &profiles,
            shared.region.get(),
            &*shared.probe,
        )
    }

    /// The child this process last admitted has exited.
    ///
    /// Releases this process's pre-spawn reservation immediately, rather
    /// than waiting for the monitor to notice.
    pub fn child_exited(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.shared.region.get().release(inner.self_pid, Mib::ZERO);
    }

    /// Flush learned profiles to the cache file now.
    ///
    /// Top level only; a sub-build calling this is a bug in the embedding
    /// tool, logged and ignored.
    pub fn flush_profiles(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.shared.config.role != Role::TopLevel {
            error!("sub-build attempted to flush memory profiles; ignored");
            return;
        }
        if let Err(e) = inner.shared.profiles().flush_if_dirty() {
            warn!("couldn't flush memory profiles: {e}");
        }
    }

    /// Orderly teardown: stop the monitor, flush profiles.
    ///
    /// The shared region is unmapped (and, at top level, unlinked) when
    /// the guard drops.  Idempotent; `Drop` calls it too.
    pub fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.shared.config.role != Role::TopLevel {
            // Nothing is ours to tear down.
            return;
        }
        if let Ok(mut monitor) = inner.monitor.lock()
            && let Some(mut monitor) = monitor.take()
        {
            monitor.stop();
        }
        self.flush_profiles();
    }

    /// Immediate stop, for the embedding tool's fatal-signal cleanup.
    ///
    /// Clears the monitor's run flag and restores the terminal, without
    /// joining the thread, flushing, or touching the region.
    pub fn stop_now(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if let Ok(monitor) = inner.monitor.lock()
            && let Some(monitor) = monitor.as_ref()
        {
            monitor.stop_now();
        }
    }
}

impl Drop for MemGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use remake_probe::mock::MockProbe;

    /// A config pointed at scratch resources, safe to run in parallel.
    fn scratch_config(dir: &tempfile::TempDir, role: Role) -> Config {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let unique = NEXT.fetch_add(1, Ordering::Relaxed);
        let mut b = Config::builder();
        b.display(false)
            .role(role)
            .cache_file(dir.path().join(".make_memory_cache"))
            .shm_name(format!(
                "/remake_guard_test_{}_{unique}",
                std::process::id(),
            ));
        b.build().unwrap()
    }

    #[test]
    fn disabled_guard_is_inert() {
        let guard = MemGuard::disabled();
        assert!(!guard.is_enabled());
        assert_eq!(guard.may_spawn(["cc", "src/a.cpp"]), Admission::Go);
        guard.child_exited();
        guard.flush_profiles();
        guard.stop_now();
        guard.shutdown();
    }

    #[test]
    fn config_toggle_disables() {
        let mut b = Config::builder();
        b.enabled(false);
        let guard = MemGuard::new(b.build().unwrap(), Arc::new(MockProbe::new()));
        assert!(!guard.is_enabled());
    }

    #[test]
    fn sub_build_does_nothing_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(MockProbe::with_memory(Mib(4096), Mib(8192)));
        let guard = MemGuard::new(scratch_config(&dir, Role::SubBuild), probe);
        assert!(guard.is_enabled());

        // Empty store: everything is unknown, everything is admitted.
        assert_eq!(guard.may_spawn(["cc", "-c", "src/a.cpp"]), Admission::Go);

        // No cache file is loaded, flushed, or created by a sub-build.
        guard.flush_profiles();
        guard.shutdown();
        assert!(!dir.path().join(".make_memory_cache").exists());
    }

    #[test]
    #[tracing_test::traced_test]
    fn sub_build_flush_is_logged_misuse() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(MockProbe::with_memory(Mib(4096), Mib(8192)));
        let guard = MemGuard::new(scratch_config(&dir, Role::SubBuild), probe);

        guard.flush_profiles();
        assert!(logs_contain("sub-build attempted to flush"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn top_level_cold_start_learns_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::with_memory(Mib(8192), Mib(16384));
        let root = std::process::id();
        probe.add_process(4001, root, Mib(10), Some(&["cc1plus", "-c", "src/a.cpp"]));

        let guard = MemGuard::new(scratch_config(&dir, Role::TopLevel), Arc::new(probe.clone()));
        assert!(guard.is_enabled());

        // Nothing known about a.cpp yet: admitted without a reservation.
        assert_eq!(guard.may_spawn(["cc1plus", "-c", "src/a.cpp"]), Admission::Go);

        // Let the monitor take a few ticks while the job peaks and exits.
        std::thread::sleep(Duration::from_millis(250));
        probe.set_rss(4001, Mib(42));
        std::thread::sleep(Duration::from_millis(250));
        probe.remove_process(4001);
        std::thread::sleep(Duration::from_millis(250));

        guard.shutdown();

        // The learned profile survived to disk, peak first on the line.
        let cache = std::fs::read_to_string(dir.path().join(".make_memory_cache")).unwrap();
        let line = cache
            .lines()
            .find(|l| l.ends_with("src/a.cpp"))
            .expect("profile line missing");
        assert!(line.starts_with("42 "), "{line:?}");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn warm_start_waits_under_pressure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".make_memory_cache"),
            "512 1700000000 src/b.cpp\n",
        )
        .unwrap();

        let probe = MockProbe::with_memory(Mib(300), Mib(16384));
        let guard = MemGuard::new(scratch_config(&dir, Role::TopLevel), Arc::new(probe.clone()));

        assert_eq!(guard.may_spawn(["cc", "-c", "src/b.cpp"]), Admission::Wait);

        // Memory frees up; the retry is admitted and reserved.
        probe.set_avail(Mib(700));
        assert_eq!(guard.may_spawn(["cc", "-c", "src/b.cpp"]), Admission::Go);

        // The reaper hook hands the reservation back.
        guard.child_exited();
        guard.shutdown();
    }

    #[test]
    fn probeless_host_still_learns() {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::new(); // host_memory() is None
        let root = std::process::id();
        probe.add_process(4400, root, Mib(64), Some(&["cc", "-c", "lib/x.c"]));

        let mut config = Config::builder();
        config
            .display(false)
            .role(Role::TopLevel)
            .cache_file(dir.path().join(".make_memory_cache"))
            .shm_name(format!("/remake_probeless_test_{}", std::process::id()));
        let guard = MemGuard::new(config.build().unwrap(), Arc::new(probe.clone()));
        if !guard.is_enabled() {
            // Hosts without POSIX shm skip the rest.
            return;
        }

        // Admission degrades to always-go...
        assert_eq!(guard.may_spawn(["cc", "-c", "lib/x.c"]), Admission::Go);

        // ...but profiles are still learned.
        std::thread::sleep(Duration::from_millis(250));
        guard.shutdown();
        let cache = std::fs::read_to_string(dir.path().join(".make_memory_cache")).unwrap();
        assert!(cache.contains("lib/x.c"), "{cache:?}");
    }
}
