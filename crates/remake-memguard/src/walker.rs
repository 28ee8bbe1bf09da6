//! The descendant walker
//!
//! Once per monitor tick we descend the live process tree from the
//! top-level build's pid, keep a table of everything we find, and turn
//! the raw RSS figures into the three numbers the rest of the system
//! wants: how many jobs are running, how much memory the build is using,
//! and how much of the historically-observed peak memory has not
//! materialized yet ("unused peaks").
//!
//! The walk is the only traversal; the parent links we store are never
//! followed.  Starting from the root every tick means a descendant that
//! re-parents away from the build simply stops being found, with no cycle
//! risk even under OS re-parenting.
//!
//! The OS view is authoritative and we take no locks around it: a process
//! that spawns or exits mid-walk shows up wrong for at most one tick.

use crate::internal_prelude::*;

/// Totals produced by one walk over the descendant tree
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct WalkTotals {
    /// Live tracked descendants
    pub(crate) jobs: usize,
    /// Total RSS of all descendants
    pub(crate) build_rss: Mib,
    /// Σ (historical peak − current RSS), over profiled descendants
    /// currently below their historical peak
    pub(crate) unused_peaks: Mib,
}

/// One tracked descendant
#[derive(Debug)]
struct Descendant {
    /// Parent pid within the tracked tree (the admitting process)
    parent: Pid,
    /// The profile this compilation updates, if classification worked
    profile: Option<ProfileId>,
    /// Current RSS, as of the latest walk
    current: Mib,
    /// Peak RSS we have observed ourselves
    peak: Mib,
    /// Stored profile peak at the moment we first saw this descendant
    old_peak: Mib,
    /// Stamp of the walk that last found this pid
    seen: u64,
}

/// Stateful walker over the build's process tree
#[derive(Debug)]
pub(crate) struct DescendantWalker {
    /// The top-level build's pid; every walk starts here
    root: Pid,
    /// Classification rules, shared with the gate
    rules: ClassifyRules,
    /// Everything currently tracked, by pid
    table: HashMap<Pid, Descendant>,
    /// Incremented per walk; entries not stamped get swept
    stamp: u64,
}

impl DescendantWalker {
    /// Make a walker rooted at `root`.
    pub(crate) fn new(root: Pid, rules: ClassifyRules) -> Self {
        DescendantWalker {
            root,
            rules,
            table: HashMap::new(),
            stamp: 0,
        }
    }

    /// Walk the tree once: discover, update, sweep, total.
    pub(crate) fn walk_tick(
        &mut self,
        probe: &dyn SystemProbe,
        profiles: &mut ProfileStore,
        region: &AccountingRegion,
    ) -> WalkTotals {
        self.stamp += 1;

        // Depth-first over (pid, parent) pairs, starting from the root's
        // children.  Order doesn't matter; reachability does.
        let mut frontier: Vec<(Pid, Pid)> = probe
            .children_of(self.root)
            .into_iter()
            .map(|c| (c, self.root))
            .collect();
        while let Some((pid, parent)) = frontier.pop() {
            frontier.extend(probe.children_of(pid).into_iter().map(|c| (c, pid)));
            self.visit(pid, parent, probe, profiles, region);
        }

        self.sweep(probe, profiles, region);
        self.totals()
    }

    /// Update or create the table entry for one live descendant.
    fn visit(
        &mut self,
        pid: Pid,
        parent: Pid,
        probe: &dyn SystemProbe,
        profiles: &mut ProfileStore,
        region: &AccountingRegion,
    ) {
        // Vanished between enumeration and read; the sweep handles it.
        let Some(rss) = probe.rss_mib(pid) else {
            return;
        };

        if let Some(entry) = self.table.get_mut(&pid) {
            entry.seen = self.stamp;
            entry.current = rss;
            if rss > entry.peak {
                entry.peak = rss;
                if let Some(id) = entry.profile {
                    profiles.update_by_id(id, rss, false);
                }
            }
            return;
        }

        // First sighting: classify and attribute.
        let classified = probe
            .cmdline(pid)
            .and_then(|argv| self.rules.classify(argv.iter().map(String::as_str)));
        let (profile, old_peak) = match classified {
            Some(path) => match profiles.lookup(&path) {
                Some((id, stored_peak, _last_used)) => {
                    // The admission gate reserved this peak before the
                    // spawn; now that the child is visible its memory is
                    // accounted through RSS and unused-peak, so hand the
                    // reservation back.
                    region.hand_back(parent, stored_peak);
                    (Some(id), stored_peak)
                }
                None => {
                    let id = profiles.insert_or_update(&path, rss, false);
                    (Some(id), Mib::ZERO)
                }
            },
            None => (None, Mib::ZERO),
        };

        self.table.insert(
            pid,
            Descendant {
                parent,
                profile,
                current: rss,
                peak: rss,
                old_peak,
                seen: self.stamp,
            },
        );
    }

    /// Drop everything the walk no longer found.
    ///
    /// An unseen pid that is genuinely gone gets its final profile update
    /// and loses any reservation it held.  An unseen pid that is still
    /// alive was re-parented out of the build; it is dropped silently.
    fn sweep(
        &mut self,
        probe: &dyn SystemProbe,
        profiles: &mut ProfileStore,
        region: &AccountingRegion,
    ) {
        let stamp = self.stamp;
        let mut departed: Vec<(Pid, Option<ProfileId>, Mib)> = Vec::new();
        self.table.retain(|&pid, entry| {
            if entry.seen == stamp {
                return true;
            }
            if probe.rss_mib(pid).is_none() {
                departed.push((pid, entry.profile, entry.peak));
            } else {
                trace!("descendant {pid} re-parented away; dropping");
            }
            false
        });
        for (pid, profile, peak) in departed {
            if let Some(id) = profile {
                profiles.update_by_id(id, peak, true);
            }
            region.release(pid, Mib::ZERO);
        }
    }

    /// Totals over the live table.
    fn totals(&self) -> WalkTotals {
        let mut out = WalkTotals::default();
        for entry in self.table.values() {
            out.jobs += 1;
            out.build_rss += entry.current;
            if entry.profile.is_some() && entry.current < entry.old_peak {
                out.unused_peaks += entry.old_peak.saturating_sub(entry.current);
            }
        }
        out
    }

    /// The tracked view of one pid's parent (tests and diagnostics).
    #[cfg(test)]
    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.table.get(&pid).map(|e| e.parent)
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

    /// The fixed root pid the tests use
    const ROOT: Pid = 100;

    struct Rig {
        probe: MockProbe,
        profiles: ProfileStore,
        region: AccountingRegion,
        walker: DescendantWalker,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let probe = MockProbe::with_memory(Mib(8192), Mib(16384));
        probe.add_process(ROOT, 1, Mib(5), Some(&["remake", "-j8"]));
        let config = Config::builder().build().unwrap();
        Rig {
            probe,
            profiles: ProfileStore::new(dir.path().join("cache"), 3),
            region: AccountingRegion::anonymous(),
            walker: DescendantWalker::new(ROOT, ClassifyRules::from_config(&config)),
            _dir: dir,
        }
    }

    impl Rig {
        fn tick(&mut self) -> WalkTotals {
            self.walker
                .walk_tick(&self.probe, &mut self.profiles, &self.region)
        }
    }

    #[test]
    fn cold_start_learns_a_profile() {
        let mut rig = rig();
        assert_eq!(rig.tick(), WalkTotals::default());

        rig.probe
            .add_process(4001, ROOT, Mib(10), Some(&["cc1plus", "src/a.cpp"]));
        let t = rig.tick();
        assert_eq!(t.jobs, 1);
        assert_eq!(t.build_rss, Mib(10));
        assert_eq!(t.unused_peaks, Mib::ZERO);
        assert_eq!(rig.profiles.lookup("src/a.cpp").unwrap().1, Mib(10));

        // Peak grows while it runs.
        rig.probe.set_rss(4001, Mib(42));
        let t = rig.tick();
        assert_eq!(t.build_rss, Mib(42));
        assert_eq!(rig.profiles.lookup("src/a.cpp").unwrap().1, Mib(42));

        // It shrinks before exiting; the final update keeps the peak.
        rig.probe.set_rss(4001, Mib(20));
        rig.tick();
        rig.probe.remove_process(4001);
        let t = rig.tick();
        assert_eq!(t.jobs, 0);
        assert_eq!(rig.profiles.lookup("src/a.cpp").unwrap().1, Mib(42));
    }

    #[test]
    fn implicit_release_of_prespawn_reservation() {
        let mut rig = rig();
        rig.profiles.insert_or_update("src/c.cpp", Mib(200), false);

        // The admitting process (the root) reserved the profile peak.
        assert!(rig.region.reserve(ROOT, Mib(200)));
        assert_eq!(rig.region.totals().reserved, Mib(200));

        rig.probe
            .add_process(5000, ROOT, Mib(15), Some(&["cc1plus", "src/c.cpp"]));
        let t = rig.tick();

        // The child is now accounted through RSS + unused peak instead.
        assert_eq!(rig.region.totals().reserved, Mib::ZERO);
        assert_eq!(t.unused_peaks, Mib(185));
        assert_eq!(t.build_rss, Mib(15));
    }

    #[test]
    fn unused_peaks_clamp_at_zero() {
        let mut rig = rig();
        rig.profiles.insert_or_update("src/c.cpp", Mib(100), false);
        rig.probe
            .add_process(5000, ROOT, Mib(150), Some(&["cc1plus", "src/c.cpp"]));
        let t = rig.tick();
        // Running beyond the historical peak contributes nothing negative.
        assert_eq!(t.unused_peaks, Mib::ZERO);
        // And the profile learned the new high-water mark.
        assert_eq!(rig.profiles.lookup("src/c.cpp").unwrap().1, Mib(150));
    }

    #[test]
    fn concurrent_same_source_share_a_profile() {
        let mut rig = rig();
        rig.probe
            .add_process(6001, ROOT, Mib(30), Some(&["cc", "-c", "common/gen.c"]));
        rig.probe
            .add_process(6002, ROOT, Mib(50), Some(&["cc", "-c", "common/gen.c"]));
        let t = rig.tick();
        assert_eq!(t.jobs, 2);
        assert_eq!(t.build_rss, Mib(80));
        assert_eq!(rig.profiles.len(), 1);
        // Max semantics across the pair.
        assert_eq!(rig.profiles.lookup("common/gen.c").unwrap().1, Mib(50));
    }

    #[test]
    fn unclassified_descendants_still_count() {
        let mut rig = rig();
        rig.probe
            .add_process(7000, ROOT, Mib(25), Some(&["sh", "-c", "true"]));
        rig.probe.add_process(7001, 7000, Mib(35), None);
        let t = rig.tick();
        assert_eq!(t.jobs, 2);
        assert_eq!(t.build_rss, Mib(60));
        assert_eq!(rig.profiles.len(), 0);
        assert_eq!(rig.walker.parent_of(7001), Some(7000));
    }

    #[test]
    fn ticks_are_idempotent_without_os_change() {
        let mut rig = rig();
        rig.profiles.insert_or_update("src/a.cpp", Mib(90), false);
        rig.probe
            .add_process(4001, ROOT, Mib(40), Some(&["cc", "src/a.cpp"]));

        let first = rig.tick();
        rig.profiles.flush_if_dirty().unwrap();
        let before = rig.profiles.len();

        for _ in 0..5 {
            assert_eq!(rig.tick(), first);
        }
        assert_eq!(rig.profiles.len(), before);
        assert!(!rig.profiles.is_dirty());
        assert_eq!(rig.region.totals(), Totals::default());
    }

    #[test]
    fn exit_applies_final_decay() {
        let mut rig = rig();
        rig.profiles.insert_or_update("src/d.cpp", Mib(900), false);
        rig.probe
            .add_process(4400, ROOT, Mib(600), Some(&["cc", "src/d.cpp"]));
        rig.tick();
        rig.probe.remove_process(4400);
        rig.tick();
        // 900 - (900 - 600)/3 = 800
        assert_eq!(rig.profiles.lookup("src/d.cpp").unwrap().1, Mib(800));
    }

    #[test]
    fn reparented_descendants_drop_silently() {
        let mut rig = rig();
        rig.profiles.insert_or_update("src/d.cpp", Mib(900), false);
        rig.probe
            .add_process(4500, ROOT, Mib(600), Some(&["cc", "src/d.cpp"]));
        rig.tick();

        // Still alive, but no longer under the build.
        rig.probe.add_process(4500, 1, Mib(600), Some(&["cc", "src/d.cpp"]));
        let t = rig.tick();
        assert_eq!(t.jobs, 0);
        // No final update happened: the stored peak is untouched.
        assert_eq!(rig.profiles.lookup("src/d.cpp").unwrap().1, Mib(900));
    }

    #[test]
    fn vanished_pid_loses_its_reservation() {
        let mut rig = rig();
        // A sub-build process holds a reservation, then crashes.
        rig.probe
            .add_process(8000, ROOT, Mib(12), Some(&["remake", "-C", "sub"]));
        rig.tick();
        assert!(rig.region.reserve(8000, Mib(300)));

        rig.probe.remove_process(8000);
        rig.tick();
        assert_eq!(rig.region.totals().reserved, Mib::ZERO);
    }
}
