//! The monitor loop
//!
//! One plain thread, top-level build only.  Every ~100 ms it probes host
//! memory, walks the descendant tree, publishes the accounting totals,
//! repaints the status line on a 300 ms cadence, and flushes dirty
//! profiles at most every 10 s.  It holds no lock across a tick boundary
//! and exits within one tick of its run flag clearing.

use crate::internal_prelude::*;

use crate::status::{StatusRenderer, StatusSnapshot, TermChannel};
use crate::walker::DescendantWalker;

use std::thread;

/// Tick period
const TICK: Duration = Duration::from_millis(100);

/// Repaint every this many ticks (300 ms)
const RENDER_EVERY: u64 = 3;

/// Minimum interval between profile flushes
const FLUSH_EVERY: Duration = Duration::from_secs(10);

/// State shared between the recipe-driving thread and the monitor
///
/// This is the "core context" of the whole crate: the guard holds an
/// `Arc` of it for the admission path, and the monitor thread holds
/// another for the accounting path.
#[derive(Debug)]
pub(crate) struct MonitorShared {
    /// The OS capability set
    pub(crate) probe: Arc<dyn SystemProbe>,
    /// The profile store; the monitor writes, the gate reads
    pub(crate) profiles: Mutex<ProfileStore>,
    /// The per-host accounting region (possibly still unattached)
    pub(crate) region: RegionSlot,
    /// The configuration this guard was built with
    pub(crate) config: Config,
}

impl MonitorShared {
    /// Lock the profile store, riding over poisoning.
    ///
    /// The store's invariants are per-entry; a panicking tick cannot
    /// leave it in a state worth abandoning admission over.
    pub(crate) fn profiles(&self) -> MutexGuard<'_, ProfileStore> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle onto a running (or stopped) monitor thread
#[derive(Debug)]
pub(crate) struct Monitor {
    /// Cleared to ask the thread to stop
    run: Arc<AtomicBool>,
    /// The thread, until joined
    join: Option<thread::JoinHandle<()>>,
    /// The renderer's channel, for terminal restoration without a join
    term: Option<Arc<TermChannel>>,
}

impl Monitor {
    /// Spawn the monitor thread for the build rooted at `root`.
    ///
    /// The renderer is set up here, before the thread exists, so the one
    /// terminal query in its lifetime happens at a well-defined moment.
    pub(crate) fn spawn(shared: Arc<MonitorShared>, root: Pid) -> Monitor {
        let run = Arc::new(AtomicBool::new(true));
        let renderer = StatusRenderer::new(shared.config.display);
        let term = renderer.as_ref().map(StatusRenderer::channel);

        let thread_run = Arc::clone(&run);
        let join = thread::Builder::new()
            .name("remake-memguard".to_owned())
            .spawn(move || run_loop(&shared, &thread_run, renderer, root))
            .map_err(|e| {
                warn!("couldn't spawn memory monitor thread: {e}");
                e
            })
            .ok();

        Monitor { run, join, term }
    }

    /// Ask the thread to stop and wait for it.
    pub(crate) fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            warn!("memory monitor thread panicked");
        }
    }

    /// Immediate stop: clear the flag and restore the terminal, without
    /// joining.  Safe to call from the embedding tool's cleanup handler.
    pub(crate) fn stop_now(&self) {
        self.run.store(false, Ordering::Release);
        if let Some(term) = &self.term {
            term.restore_terminal();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The thread body.
fn run_loop(
    shared: &MonitorShared,
    run: &AtomicBool,
    mut renderer: Option<StatusRenderer>,
    root: Pid,
) {
    let rules = ClassifyRules::from_config(&shared.config);
    let mut walker = DescendantWalker::new(root, rules);
    let mut tick_no: u64 = 0;
    let mut last_flush = Instant::now();
    let mut totals_diverged = false;

    while run.load(Ordering::Acquire) {
        let host = shared.probe.host_memory();

        let walk = {
            let mut profiles = shared.profiles();
            walker.walk_tick(&*shared.probe, &mut profiles, shared.region.get())
        };
        shared.region.get().publish_unused_peaks(walk.unused_peaks);

        // The running scalar should match the table; the table wins.
        let region = shared.region.get();
        let table = region.table_reserved();
        let scalar = region.totals().reserved;
        if table != scalar {
            if !totals_diverged {
                warn!("reserved-memory total {scalar} disagrees with table sum {table}; repairing");
                totals_diverged = true;
            }
            region.repair_reserved(table);
        } else {
            totals_diverged = false;
        }

        if shared.config.chatter(3) {
            trace!(
                "tick: jobs={} rss={} unused={} reserved={}",
                walk.jobs, walk.build_rss, walk.unused_peaks, table
            );
        }

        if tick_no % RENDER_EVERY == 0
            && let Some(r) = renderer.as_mut()
        {
            // Unknown host memory hides the display rather than painting
            // nonsense.
            if let Some(host) = host {
                let snap = StatusSnapshot {
                    host,
                    build_rss: walk.build_rss,
                    imminent: region.totals().imminent(),
                    jobs: walk.jobs,
                };
                if !r.render(&snap) {
                    debug!("status channel closed; display off for this build");
                    renderer = None;
                }
            }
        }

        if last_flush.elapsed() >= FLUSH_EVERY {
            let mut profiles = shared.profiles();
            match profiles.flush_if_dirty() {
                Ok(true) => last_flush = Instant::now(),
                Ok(false) => {}
                Err(e) => {
                    // Retry at the next interval; the build goes on.
                    warn!("couldn't flush memory profiles: {e}");
                    last_flush = Instant::now();
                }
            }
        }

        tick_no += 1;
        thread::sleep(TICK);
    }

    if let Some(r) = renderer {
        r.finish();
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

    fn shared_with(probe: &MockProbe, dir: &tempfile::TempDir) -> Arc<MonitorShared> {
        let mut config = Config::builder();
        config.display(false);
        Arc::new(MonitorShared {
            probe: Arc::new(probe.clone()),
            profiles: Mutex::new(ProfileStore::new(dir.path().join("cache"), 3)),
            region: RegionSlot::eager(AccountingRegion::anonymous()),
            config: config.build().unwrap(),
        })
    }

    #[test]
    fn monitors_learn_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::with_memory(Mib(8192), Mib(16384));
        probe.add_process(100, 1, Mib(5), Some(&["remake"]));
        probe.add_process(4001, 100, Mib(42), Some(&["cc1plus", "src/a.cpp"]));
        let shared = shared_with(&probe, &dir);

        let mut monitor = Monitor::spawn(Arc::clone(&shared), 100);
        // A few ticks' worth of wall clock, then stop.
        thread::sleep(TICK * 5);
        monitor.stop();

        assert_eq!(shared.profiles().lookup("src/a.cpp").unwrap().1, Mib(42));

        // Stopped means stopped: the world can change and nothing
        // happens.
        probe.set_rss(4001, Mib(999));
        thread::sleep(TICK * 2);
        assert_eq!(shared.profiles().lookup("src/a.cpp").unwrap().1, Mib(42));
    }

    #[test]
    fn monitor_repairs_diverged_totals() {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::with_memory(Mib(8192), Mib(16384));
        probe.add_process(100, 1, Mib(5), None);
        let shared = shared_with(&probe, &dir);

        assert!(shared.region.get().reserve(55, Mib(10)));
        // Sabotage the running scalar; the monitor should restore it
        // from the table within a tick or two.
        shared.region.get().repair_reserved(Mib(999));

        let mut monitor = Monitor::spawn(Arc::clone(&shared), 100);
        thread::sleep(TICK * 3);
        monitor.stop();

        assert_eq!(shared.region.get().totals().reserved, Mib(10));
    }

    #[test]
    fn zero_descendants_still_tick() {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::with_memory(Mib(8192), Mib(16384));
        probe.add_process(100, 1, Mib(5), None);
        let shared = shared_with(&probe, &dir);

        let mut monitor = Monitor::spawn(Arc::clone(&shared), 100);
        thread::sleep(TICK * 3);
        monitor.stop();

        assert_eq!(shared.region.get().totals().unused_peaks, Mib::ZERO);
        assert_eq!(shared.profiles().len(), 0);
    }
}
