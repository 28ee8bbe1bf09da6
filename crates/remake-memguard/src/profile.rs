//! The peak-memory profile store
//!
//! One record per source-file path: the peak resident memory any
//! compilation of that file has been seen to use, and when it was last
//! touched.  The store is what turns "we built this tree before" into a
//! usable prediction for the admission gate.
//!
//! The backing array only ever grows, and entries are never reordered, so
//! a [`ProfileId`] handed out once stays valid for the life of the
//! process; the descendant walker relies on that across ticks.
//!
//! Persistence is a line-oriented text file, written to a `.tmp` sibling
//! and installed by atomic rename, the same discipline the runner's other
//! state files use.  Readers skip lines they cannot parse.

use crate::error::FlushError;
use crate::internal_prelude::*;

use std::fs;
use std::io::Write as _;

/// Initial capacity of the backing array
///
/// Grown by doubling; entries are never moved or removed.
const INITIAL_CAPACITY: usize = 1000;

/// Index of one profile in the store
///
/// Stable for the life of the process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct ProfileId(usize);

/// One learned profile
#[derive(Debug, Clone)]
struct ProfileEntry {
    /// Canonical source path (leading `../` already stripped)
    path: Box<str>,
    /// Peak resident memory any compilation of this path has reached
    peak: Mib,
    /// Wall-clock seconds since the epoch of the last update
    last_used: i64,
}

/// The in-memory profile table plus its on-disk cache file
#[derive(Debug)]
pub(crate) struct ProfileStore {
    /// The grow-only backing array
    entries: Vec<ProfileEntry>,
    /// Path -> index; the index is authoritative for lookups
    index: HashMap<Box<str>, ProfileId>,
    /// Has anything changed since the last flush?
    dirty: bool,
    /// Divisor for the final-exit decay (nonzero, from the config)
    decay_divisor: u64,
    /// Where the cache file lives
    cache_path: PathBuf,
}

impl ProfileStore {
    /// Make an empty store that will persist to `cache_path`.
    pub(crate) fn new(cache_path: PathBuf, decay_divisor: u32) -> Self {
        ProfileStore {
            entries: Vec::with_capacity(INITIAL_CAPACITY),
            index: HashMap::with_capacity(INITIAL_CAPACITY),
            dirty: false,
            decay_divisor: decay_divisor.into(),
            cache_path,
        }
    }

    /// Load the cache file, if there is one.
    ///
    /// Called once by the top-level build at startup.  A missing file is
    /// a fresh host, not an error; unparseable lines are skipped.
    pub(crate) fn load(&mut self) {
        let Ok(text) = fs::read_to_string(&self.cache_path) else {
            debug!("no profile cache at {:?}; starting cold", self.cache_path);
            return;
        };
        let mut loaded: usize = 0;
        for line in text.lines() {
            let Some((peak, last_used, path)) = parse_record(line) else {
                continue;
            };
            let _id = self.insert_entry(path, peak, last_used);
            loaded += 1;
        }
        debug!(
            "loaded {loaded} memory profiles from {:?}",
            self.cache_path
        );
        // What we just read is what is on disk.
        self.dirty = false;
    }

    /// Look up a path: `(id, peak, last_used_secs)`.
    pub(crate) fn lookup(&self, path: &str) -> Option<(ProfileId, Mib, i64)> {
        let id = *self.index.get(path)?;
        let entry = &self.entries[id.0];
        Some((id, entry.peak, entry.last_used))
    }

    /// The stored peak for `id`.
    pub(crate) fn peak(&self, id: ProfileId) -> Mib {
        self.entries[id.0].peak
    }

    /// Record an observation of `observed` MiB for `path`.
    ///
    /// With `is_final` false this can only raise the stored peak
    /// (max semantics, so concurrent compilations of one file merge
    /// harmlessly).  With `is_final` true, an observation *below* the
    /// stored peak pulls it down by `1/decay_divisor` of the gap -- a
    /// gentle correction in case earlier runs caught transient
    /// allocations that do not recur.
    pub(crate) fn insert_or_update(&mut self, path: &str, observed: Mib, is_final: bool) -> ProfileId {
        if let Some(&id) = self.index.get(path) {
            self.update_by_id(id, observed, is_final);
            id
        } else {
            let id = self.insert_entry(path, observed, now_secs());
            if observed > Mib::ZERO {
                self.dirty = true;
            }
            id
        }
    }

    /// Record an observation against an already-known profile.
    ///
    /// Same semantics as [`insert_or_update`](Self::insert_or_update) for
    /// an existing path; the walker uses this to avoid re-keying by path
    /// every tick.
    pub(crate) fn update_by_id(&mut self, id: ProfileId, observed: Mib, is_final: bool) {
        let entry = &mut self.entries[id.0];
        entry.last_used = now_secs();
        if observed >= entry.peak {
            if observed > entry.peak {
                entry.peak = observed;
                self.dirty = true;
            }
        } else if is_final {
            let gap = entry.peak.as_u64() - observed.as_u64();
            entry.peak = Mib(entry.peak.as_u64() - gap / self.decay_divisor);
            self.dirty = true;
        }
    }

    /// Append a fresh entry, growing the backing array by doubling.
    fn insert_entry(&mut self, path: &str, peak: Mib, last_used: i64) -> ProfileId {
        if let Some(&id) = self.index.get(path) {
            // Duplicate line in the cache file; keep the larger peak.
            let entry = &mut self.entries[id.0];
            entry.peak = entry.peak.max(peak);
            return id;
        }
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(self.entries.capacity());
        }
        let id = ProfileId(self.entries.len());
        self.entries.push(ProfileEntry {
            path: path.into(),
            peak,
            last_used,
        });
        self.index.insert(path.into(), id);
        id
    }

    /// Is there anything to flush?
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Atomically rewrite the cache file, if anything changed.
    ///
    /// Returns whether a flush happened.  Rate limiting is the monitor
    /// loop's business, not ours.
    pub(crate) fn flush_if_dirty(&mut self) -> Result<bool, FlushError> {
        if !self.dirty {
            return Ok(false);
        }
        let tmp = {
            let mut os = self.cache_path.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        let write = |path: &Path| -> std::io::Result<()> {
            let mut f = fs::File::create(path)?;
            for entry in &self.entries {
                // Zero-peak entries carry no prediction; keep the file
                // compact by omitting them.
                if entry.peak == Mib::ZERO {
                    continue;
                }
                writeln!(
                    f,
                    "{} {} {}",
                    entry.peak.as_u64(),
                    entry.last_used,
                    entry.path
                )?;
            }
            f.sync_all()
        };
        write(&tmp).map_err(|source| FlushError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.cache_path).map_err(|source| FlushError::Rename {
            path: self.cache_path.clone(),
            source,
        })?;
        self.dirty = false;
        trace!("flushed {} profiles to {:?}", self.entries.len(), self.cache_path);
        Ok(true)
    }

    /// Number of profiles (tests and diagnostics).
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parse one cache-file record: `<peak_mib> <last_used_secs> <path>`.
///
/// The path is the remainder of the line, so a path containing spaces
/// survives a round trip even though we never write one ourselves.
fn parse_record(line: &str) -> Option<(Mib, i64, &str)> {
    let mut fields = line.splitn(3, [' ', '\t']);
    let peak: u64 = fields.next()?.parse().ok()?;
    let last_used: i64 = fields.next()?.parse().ok()?;
    let path = fields.next()?.trim();
    if path.is_empty() {
        return None;
    }
    Some((Mib(peak), last_used, path))
}

/// Wall-clock seconds since the epoch.
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
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

    fn store_at(dir: &tempfile::TempDir) -> ProfileStore {
        ProfileStore::new(dir.path().join(".make_memory_cache"), 3)
    }

    #[test]
    fn raise_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);

        let id = store.insert_or_update("src/a.cpp", Mib(100), false);
        assert_eq!(store.peak(id), Mib(100));

        // Lower non-final observations change nothing.
        store.insert_or_update("src/a.cpp", Mib(40), false);
        assert_eq!(store.peak(id), Mib(100));

        store.insert_or_update("src/a.cpp", Mib(160), false);
        assert_eq!(store.peak(id), Mib(160));
    }

    #[test]
    fn final_decay() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);

        let id = store.insert_or_update("src/d.cpp", Mib(900), false);
        // 900 - (900 - 600)/3 = 800
        store.insert_or_update("src/d.cpp", Mib(600), true);
        assert_eq!(store.peak(id), Mib(800));

        // A final observation at or above the stored peak just raises.
        store.insert_or_update("src/d.cpp", Mib(850), true);
        assert_eq!(store.peak(id), Mib(850));
    }

    #[test]
    fn decay_divisor_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::new(dir.path().join("cache"), 2);
        let id = store.insert_or_update("src/d.cpp", Mib(900), false);
        store.insert_or_update("src/d.cpp", Mib(600), true);
        assert_eq!(store.peak(id), Mib(750));
    }

    #[test]
    fn dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        assert!(!store.is_dirty());

        store.insert_or_update("src/a.cpp", Mib(10), false);
        assert!(store.is_dirty());
        assert!(store.flush_if_dirty().unwrap());
        assert!(!store.is_dirty());

        // An observation that doesn't move the peak isn't dirtying.
        store.insert_or_update("src/a.cpp", Mib(10), false);
        assert!(!store.is_dirty());
        assert!(!store.flush_if_dirty().unwrap());
    }

    #[test]
    fn ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        let a = store.insert_or_update("src/a.cpp", Mib(1), false);
        let b = store.insert_or_update("src/b.cpp", Mib(2), false);
        for i in 0..2000 {
            store.insert_or_update(&format!("gen/f{i}.cpp"), Mib(1), false);
        }
        let (a2, _, _) = store.lookup("src/a.cpp").unwrap();
        let (b2, _, _) = store.lookup("src/b.cpp").unwrap();
        assert_eq!(a, a2);
        assert_eq!(b, b2);
        assert_eq!(store.len(), 2002);
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        store.insert_or_update("src/a.cpp", Mib(42), false);
        store.insert_or_update("lib/deep/b.cc", Mib(512), false);
        // Zero-peak entries are dropped by persistence.
        store.insert_or_update("src/empty.c", Mib(0), false);
        store.flush_if_dirty().unwrap();

        let mut reloaded = store_at(&dir);
        reloaded.load();
        assert!(!reloaded.is_dirty());
        assert_eq!(reloaded.lookup("src/a.cpp").unwrap().1, Mib(42));
        assert_eq!(reloaded.lookup("lib/deep/b.cc").unwrap().1, Mib(512));
        assert!(reloaded.lookup("src/empty.c").is_none());
    }

    #[test]
    fn tolerant_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".make_memory_cache");
        fs::write(
            &path,
            "42 1700000000 src/a.cpp\n\
             not a record\n\
             99\n\
             17 bad-timestamp src/b.cpp\n\
             7 1700000001 src/c.cpp\n",
        )
        .unwrap();

        let mut store = ProfileStore::new(path, 3);
        store.load();
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup("src/a.cpp").unwrap().1, Mib(42));
        assert_eq!(store.lookup("src/c.cpp").unwrap().1, Mib(7));
    }

    #[test]
    fn fresh_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        store.load();
        assert_eq!(store.len(), 0);
        assert!(store.lookup("src/a.cpp").is_none());
    }
}
