//! The per-host shared accounting region
//!
//! Every participating build process -- the top-level build, its
//! recursive sub-builds, and any unrelated sibling builds on the same
//! host -- maps one well-known POSIX shared-memory object and accounts
//! its reservations there.  The region holds a fixed table of
//! `(pid, reserved_mib)` slots and two running totals; that is the whole
//! cross-process protocol.
//!
//! Layout discipline: the region is a fixed-size page with a `repr(C)`
//! header, 8-byte aligned scalars, and a magic/version pair so that an
//! incompatible survivor from another tool (or another layout revision)
//! is left untouched.  The two multi-field updates -- slot allocation and
//! total arithmetic -- are each guarded by their own process-shared
//! mutex; everything read on the hot path is a lock-free atomic.
//!
//! The top-level build creates and zeroes the object (a stale object from
//! a crashed build is deliberately reused and re-zeroed) and unlinks it
//! at teardown.  Sub-builds only attach.  An anonymous in-process variant
//! backs tests and hosts without POSIX shared memory.

use crate::internal_prelude::*;

/// Number of reservation slots
///
/// Any value at least as large as the expected peak concurrency works; a
/// full table is not an error, just an unreserved admission.
pub(crate) const MAX_RESERVATIONS: usize = 64;

/// Both running totals, as the gate reads them
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct Totals {
    /// Sum of the reservation table
    pub(crate) reserved: Mib,
    /// Published by the monitor: Σ (historical peak − current RSS)
    pub(crate) unused_peaks: Mib,
}

impl Totals {
    /// Memory that is spoken for but not yet resident: the quantity the
    /// gate subtracts from free memory.
    pub(crate) fn imminent(&self) -> Mib {
        self.reserved.saturating_add(self.unused_peaks)
    }
}

/// Clamp a [`Mib`] into the 32 bits a reservation slot stores.
fn slot_mib(mib: Mib) -> u32 {
    u32::try_from(mib.as_u64()).unwrap_or(u32::MAX)
}

#[cfg(unix)]
pub(crate) use posix::AccountingRegion;
#[cfg(not(unix))]
pub(crate) use fallback::AccountingRegion;

/// A region that may not have been attached yet
///
/// The top-level build creates its region eagerly, before the monitor
/// starts.  A sub-build does nothing at startup; it attaches on the first
/// reserve or imminent read, and if the attach fails it falls back to
/// process-local accounting rather than none at all.
#[derive(Debug)]
pub(crate) struct RegionSlot {
    /// The region, once somebody has needed it
    cell: std::sync::OnceLock<AccountingRegion>,
    /// How to attach, for the lazy case
    lazy: Option<(String, Role)>,
}

impl RegionSlot {
    /// A slot already holding a region.
    pub(crate) fn eager(region: AccountingRegion) -> Self {
        let cell = std::sync::OnceLock::new();
        let _ = cell.set(region);
        RegionSlot { cell, lazy: None }
    }

    /// A slot that will attach `name` on first use.
    pub(crate) fn lazy(name: String, role: Role) -> Self {
        RegionSlot {
            cell: std::sync::OnceLock::new(),
            lazy: Some((name, role)),
        }
    }

    /// The region, attaching if this is the first use.
    pub(crate) fn get(&self) -> &AccountingRegion {
        self.cell.get_or_init(|| {
            let Some((name, role)) = &self.lazy else {
                // An eager slot always has its cell set.
                return AccountingRegion::anonymous();
            };
            match AccountingRegion::open_shared(name, *role) {
                Ok(region) => {
                    debug!("attached shared accounting region {name:?}");
                    region
                }
                Err(e) => {
                    warn!("couldn't attach {name:?}: {e}; accounting locally");
                    AccountingRegion::anonymous()
                }
            }
        })
    }
}

#[cfg(unix)]
mod posix {
    //! The real thing: POSIX shm + process-shared pthread mutexes.

    use super::*;

    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::fd::FromRawFd as _;
    use std::ptr::NonNull;

    use static_assertions::const_assert;

    /// First word of a live region: `RMG` + layout version tag
    const REGION_MAGIC: u32 = 0x524d_4731;

    /// Layout version; bump on any change to [`RawRegion`]
    const REGION_VERSION: u32 = 1;

    /// Mapped size.  One page, regardless of layout tweaks.
    const REGION_SIZE: usize = 4096;

    /// Space reserved in the layout for one pthread mutex
    const LOCK_BLOCK_SIZE: usize = 64;

    // The header must fit the page, and a mutex must fit its block.
    const_assert!(mem::size_of::<RawRegion>() <= REGION_SIZE);
    const_assert!(mem::size_of::<libc::pthread_mutex_t>() <= LOCK_BLOCK_SIZE);
    const_assert!(mem::align_of::<RawRegion>() == 8);

    /// Storage for one process-shared mutex, stable across layouts.
    ///
    /// `pthread_mutex_t` differs in size between libcs; giving it a fixed
    /// generously-sized block keeps the wire layout identical everywhere
    /// the version tag says it is.
    #[repr(C, align(8))]
    struct LockBlock {
        /// The mutex lives at offset 0 of this storage; only ever
        /// touched through `mutex_ptr`.
        #[allow(dead_code)]
        storage: [u8; LOCK_BLOCK_SIZE],
    }

    impl LockBlock {
        /// Pointer to the mutex inside this block.
        fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
            std::ptr::from_ref(self).cast::<libc::pthread_mutex_t>().cast_mut()
        }

        /// Initialize the mutex, marking it process-shared when asked.
        ///
        /// # Safety
        ///
        /// Caller must be the sole initializer (the creating process,
        /// before publishing the magic word), and the block must be
        /// zeroed or otherwise not contain a live mutex.
        unsafe fn init(&self, process_shared: bool) {
            unsafe {
                let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
                let _ = libc::pthread_mutexattr_init(&mut attr);
                if process_shared {
                    let _ = libc::pthread_mutexattr_setpshared(
                        &mut attr,
                        libc::PTHREAD_PROCESS_SHARED,
                    );
                }
                let _ = libc::pthread_mutex_init(self.mutex_ptr(), &attr);
                let _ = libc::pthread_mutexattr_destroy(&mut attr);
            }
        }

        /// Take the mutex; released when the guard drops.
        fn lock(&self) -> LockHeld<'_> {
            // SAFETY: the mutex was initialized before the region's magic
            // word was published, and nothing ever destroys it while the
            // mapping is live.
            unsafe {
                let _ = libc::pthread_mutex_lock(self.mutex_ptr());
            }
            LockHeld { block: self }
        }
    }

    /// Guard for a held [`LockBlock`]
    struct LockHeld<'a> {
        /// The held lock
        block: &'a LockBlock,
    }

    impl Drop for LockHeld<'_> {
        fn drop(&mut self) {
            // SAFETY: we hold the lock; see `LockBlock::lock`.
            unsafe {
                let _ = libc::pthread_mutex_unlock(self.block.mutex_ptr());
            }
        }
    }

    /// One reservation slot.  `pid == 0` means free.
    #[repr(C)]
    struct Slot {
        /// Owning process, or 0
        pid: AtomicU32,
        /// Reserved peak, MiB
        mib: AtomicU32,
    }

    /// The wire layout of the region
    #[repr(C)]
    struct RawRegion {
        /// [`REGION_MAGIC`], stored last during initialization
        magic: AtomicU32,
        /// [`REGION_VERSION`]
        version: AtomicU32,
        /// Guards slot allocation (the `pid == 0` scan)
        slot_lock: LockBlock,
        /// Guards the `reserved_mib` arithmetic
        total_lock: LockBlock,
        /// High-water mark of occupied slot indices
        reservation_count: AtomicU32,
        /// Padding to keep the totals 8-aligned
        _pad: AtomicU32,
        /// Running sum of the reservation table
        reserved_mib: AtomicU64,
        /// Published by the monitor each tick
        unused_peaks_mib: AtomicU64,
        /// The reservation table
        slots: [Slot; MAX_RESERVATIONS],
    }

    /// What holds the region's memory alive
    enum Backing {
        /// A mapped POSIX shm object
        Shm {
            /// The mapping; dropped before `file`
            map: memmap2::MmapRaw,
            /// The shm object's file descriptor
            #[allow(dead_code)] // held for its Drop
            file: File,
            /// Object name, for unlinking
            name: CString,
            /// Did we create (and must we unlink) the object?
            owner: bool,
        },
        /// Process-private heap memory (tests, degraded mode)
        Anon {
            /// The allocation; freed on drop
            ptr: NonNull<RawRegion>,
        },
    }

    /// Handle onto the shared accounting region
    ///
    /// Cheap operations only; every method is safe to call from both the
    /// admission path and the monitor thread.
    pub(crate) struct AccountingRegion {
        /// The memory and its ownership story
        backing: Backing,
    }

    // SAFETY: all access to the pointed-to region goes through atomics or
    // the two in-region mutexes; the backing memory outlives the handle.
    unsafe impl Send for AccountingRegion {}
    unsafe impl Sync for AccountingRegion {}

    impl Debug for AccountingRegion {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let kind = match &self.backing {
                Backing::Shm { owner: true, .. } => "shm-owner",
                Backing::Shm { owner: false, .. } => "shm",
                Backing::Anon { .. } => "anon",
            };
            f.debug_struct("AccountingRegion")
                .field("backing", &kind)
                .field("totals", &self.totals())
                .finish()
        }
    }

    impl AccountingRegion {
        /// Create (top level) or attach (sub-build) the named region.
        pub(crate) fn open_shared(name: &str, role: Role) -> Result<Self, RegionError> {
            let cname = CString::new(name).map_err(|_| RegionError::Incompatible {
                name: name.to_owned(),
            })?;
            let create = role == Role::TopLevel;

            let oflag = if create {
                libc::O_CREAT | libc::O_RDWR
            } else {
                libc::O_RDWR
            };
            // SAFETY: plain POSIX calls; the fd is checked before use.
            let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, 0o600) };
            if fd < 0 {
                return Err(RegionError::Open {
                    name: name.to_owned(),
                    source: io::Error::last_os_error(),
                });
            }
            // SAFETY: we own this fresh fd.
            let file = unsafe { File::from_raw_fd(fd) };

            if create {
                // Sizing a stale object to its existing size is a no-op.
                file.set_len(REGION_SIZE as u64).map_err(|source| {
                    RegionError::Map {
                        name: name.to_owned(),
                        source,
                    }
                })?;
            }

            let map = memmap2::MmapOptions::new()
                .len(REGION_SIZE)
                .map_raw(&file)
                .map_err(|source| RegionError::Map {
                    name: name.to_owned(),
                    source,
                })?;

            let region = AccountingRegion {
                backing: Backing::Shm {
                    map,
                    file,
                    name: cname,
                    owner: create,
                },
            };

            if create {
                // Zero everything (including any stale survivor of a
                // crashed build), set up the mutexes process-shared, and
                // only then publish the magic word.
                //
                // SAFETY: we are the creator; nobody else trusts the
                // region until the magic word appears.
                unsafe {
                    std::ptr::write_bytes(region.base_ptr().cast::<u8>(), 0, REGION_SIZE);
                    let raw = region.raw();
                    raw.slot_lock.init(true);
                    raw.total_lock.init(true);
                    raw.version.store(REGION_VERSION, Ordering::Release);
                    raw.magic.store(REGION_MAGIC, Ordering::Release);
                }
            } else {
                let raw = region.raw();
                if raw.magic.load(Ordering::Acquire) != REGION_MAGIC
                    || raw.version.load(Ordering::Acquire) != REGION_VERSION
                {
                    return Err(RegionError::Incompatible {
                        name: name.to_owned(),
                    });
                }
            }

            Ok(region)
        }

        /// An anonymous region: same accounting, one process only.
        pub(crate) fn anonymous() -> Self {
            let layout = std::alloc::Layout::new::<RawRegion>();
            // SAFETY: the layout is nonzero; a zeroed RawRegion is a
            // valid empty region (all-atomics plus uninitialized locks,
            // which we initialize next).
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<RawRegion>();
            let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
            let region = AccountingRegion {
                backing: Backing::Anon { ptr },
            };
            // SAFETY: sole initializer; memory is zeroed.
            unsafe {
                let raw = region.raw();
                raw.slot_lock.init(false);
                raw.total_lock.init(false);
                raw.version.store(REGION_VERSION, Ordering::Release);
                raw.magic.store(REGION_MAGIC, Ordering::Release);
            }
            region
        }

        /// Base pointer of the region's memory.
        fn base_ptr(&self) -> *mut RawRegion {
            match &self.backing {
                Backing::Shm { map, .. } => map.as_mut_ptr().cast::<RawRegion>(),
                Backing::Anon { ptr } => ptr.as_ptr(),
            }
        }

        /// Shared view of the region.
        fn raw(&self) -> &RawRegion {
            // SAFETY: the mapping is live for the life of `self`, is at
            // least REGION_SIZE long, and RawRegion is valid for any bit
            // pattern in its atomic fields.
            unsafe { &*self.base_ptr() }
        }

        /// Current high-water mark, clamped to the table.
        fn count(&self) -> usize {
            (self.raw().reservation_count.load(Ordering::Acquire) as usize)
                .min(MAX_RESERVATIONS)
        }

        /// Find the slot index currently owned by `pid`.
        fn find(&self, pid: Pid) -> Option<usize> {
            let raw = self.raw();
            (0..self.count()).find(|&i| raw.slots[i].pid.load(Ordering::Acquire) == pid)
        }

        /// Adjust `reserved_mib` by a signed delta, under the total lock.
        fn adjust_reserved(&self, delta: i64) {
            if delta == 0 {
                return;
            }
            let raw = self.raw();
            let _held = raw.total_lock.lock();
            let cur = raw.reserved_mib.load(Ordering::Acquire);
            let new = if delta >= 0 {
                cur.saturating_add(delta.unsigned_abs())
            } else {
                cur.saturating_sub(delta.unsigned_abs())
            };
            raw.reserved_mib.store(new, Ordering::Release);
        }

        /// Create or overwrite `pid`'s reservation.
        ///
        /// Returns false when the table is full; the caller admits the
        /// spawn without a reservation and logs the shortfall.
        pub(crate) fn reserve(&self, pid: Pid, mib: Mib) -> bool {
            let mib = slot_mib(mib);
            let raw = self.raw();

            // Update in place if this pid already holds a slot.
            if let Some(i) = self.find(pid) {
                let old = raw.slots[i].mib.swap(mib, Ordering::AcqRel);
                self.adjust_reserved(i64::from(mib) - i64::from(old));
                return true;
            }

            // Claim the first free slot, under the slot lock.
            {
                let _held = raw.slot_lock.lock();
                let Some(i) = (0..MAX_RESERVATIONS)
                    .find(|&i| raw.slots[i].pid.load(Ordering::Acquire) == 0)
                else {
                    return false;
                };
                raw.slots[i].mib.store(mib, Ordering::Release);
                raw.slots[i].pid.store(pid, Ordering::Release);
                let hw = u32::try_from(i + 1).unwrap_or(u32::MAX);
                raw.reservation_count.fetch_max(hw, Ordering::AcqRel);
            }
            self.adjust_reserved(i64::from(mib));
            true
        }

        /// Release (`mib == 0`) or overwrite (`mib > 0`) `pid`'s
        /// reservation.
        ///
        /// Unknown pids are ignored; the reservation may already have
        /// been handed back by the monitor.
        pub(crate) fn release(&self, pid: Pid, mib: Mib) {
            let Some(i) = self.find(pid) else {
                return;
            };
            let raw = self.raw();
            let new = slot_mib(mib);
            if new == 0 {
                // Zero the amount first, then free the slot: a reader
                // never sees a freed slot still carrying a value.
                let old = raw.slots[i].mib.swap(0, Ordering::AcqRel);
                raw.slots[i].pid.store(0, Ordering::Release);
                self.adjust_reserved(-i64::from(old));
            } else {
                let old = raw.slots[i].mib.swap(new, Ordering::AcqRel);
                self.adjust_reserved(i64::from(new) - i64::from(old));
            }
        }

        /// Hand back `amount` of `pid`'s reservation.
        ///
        /// Used by the walker when a newly-observed descendant is now
        /// accounted through its live RSS: the pre-spawn reservation its
        /// admitting parent made is no longer needed.  Frees the slot
        /// when the reservation reaches zero.
        pub(crate) fn hand_back(&self, pid: Pid, amount: Mib) {
            let Some(i) = self.find(pid) else {
                return;
            };
            let raw = self.raw();
            let old = raw.slots[i].mib.load(Ordering::Acquire);
            let new = old.saturating_sub(slot_mib(amount));
            if new == 0 {
                let old = raw.slots[i].mib.swap(0, Ordering::AcqRel);
                raw.slots[i].pid.store(0, Ordering::Release);
                self.adjust_reserved(-i64::from(old));
            } else {
                raw.slots[i].mib.store(new, Ordering::Release);
                self.adjust_reserved(i64::from(new) - i64::from(old));
            }
        }

        /// Both totals, lock-free.
        pub(crate) fn totals(&self) -> Totals {
            let raw = self.raw();
            Totals {
                reserved: Mib(raw.reserved_mib.load(Ordering::Acquire)),
                unused_peaks: Mib(raw.unused_peaks_mib.load(Ordering::Acquire)),
            }
        }

        /// Publish the monitor's unused-peaks figure.
        pub(crate) fn publish_unused_peaks(&self, mib: Mib) {
            self.raw()
                .unused_peaks_mib
                .store(mib.as_u64(), Ordering::Release);
        }

        /// Recompute the reserved total from the table.
        ///
        /// The monitor compares this against the running scalar and
        /// trusts the table on divergence.
        pub(crate) fn table_reserved(&self) -> Mib {
            let raw = self.raw();
            (0..self.count())
                .filter(|&i| raw.slots[i].pid.load(Ordering::Acquire) != 0)
                .map(|i| Mib(raw.slots[i].mib.load(Ordering::Acquire).into()))
                .sum()
        }

        /// Overwrite the running scalar with a recomputed table sum.
        pub(crate) fn repair_reserved(&self, table_sum: Mib) {
            let raw = self.raw();
            let _held = raw.total_lock.lock();
            raw.reserved_mib.store(table_sum.as_u64(), Ordering::Release);
        }

        /// Number of live (nonzero-pid) slots.  Diagnostics and tests.
        pub(crate) fn live_slots(&self) -> usize {
            let raw = self.raw();
            (0..self.count())
                .filter(|&i| raw.slots[i].pid.load(Ordering::Acquire) != 0)
                .count()
        }

        /// Does `pid` currently hold a slot?  Tests.
        #[cfg(test)]
        pub(crate) fn holds_slot(&self, pid: Pid) -> bool {
            self.find(pid).is_some()
        }
    }

    impl Drop for AccountingRegion {
        fn drop(&mut self) {
            match &self.backing {
                Backing::Shm { name, owner, .. } => {
                    if *owner {
                        // SAFETY: plain POSIX call on a NUL-terminated name.
                        let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
                        if rc != 0 {
                            debug!(
                                "couldn't unlink {:?}: {}",
                                name,
                                io::Error::last_os_error()
                            );
                        }
                    }
                    // map and file drop in declaration order.
                }
                Backing::Anon { ptr } => {
                    // SAFETY: allocated in `anonymous()` with this layout.
                    unsafe {
                        std::alloc::dealloc(
                            ptr.as_ptr().cast::<u8>(),
                            std::alloc::Layout::new::<RawRegion>(),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    //! Hosts without POSIX shared memory get process-local accounting.
    //!
    //! Same bookkeeping, no cross-process visibility; `open_shared`
    //! reports the platform gap and the caller degrades per its policy.

    use super::*;

    /// One process-local reservation slot
    #[derive(Debug, Clone, Copy, Default)]
    struct Slot {
        /// Owning process, or 0
        pid: Pid,
        /// Reserved peak, MiB
        mib: u32,
    }

    /// Mutable accounting state
    #[derive(Debug)]
    struct State {
        /// The reservation table
        slots: [Slot; MAX_RESERVATIONS],
        /// Running sum of the table
        reserved: u64,
    }

    impl Default for State {
        fn default() -> Self {
            State {
                slots: [Slot::default(); MAX_RESERVATIONS],
                reserved: 0,
            }
        }
    }

    /// Process-local stand-in for the shared region
    #[derive(Debug, Default)]
    pub(crate) struct AccountingRegion {
        /// The table and its total
        state: Mutex<State>,
        /// Published by the monitor
        unused_peaks: AtomicU64,
    }

    impl AccountingRegion {
        /// Shared regions are not available on this host.
        pub(crate) fn open_shared(_name: &str, _role: Role) -> Result<Self, RegionError> {
            Err(RegionError::Unsupported)
        }

        /// An anonymous region.
        pub(crate) fn anonymous() -> Self {
            AccountingRegion::default()
        }

        /// Lock the state, riding over poisoning (no invariants to lose).
        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// See the POSIX variant.
        pub(crate) fn reserve(&self, pid: Pid, mib: Mib) -> bool {
            let mib = slot_mib(mib);
            let mut guard = self.state();
            let st = &mut *guard;
            let idx = st
                .slots
                .iter()
                .position(|s| s.pid == pid)
                .or_else(|| st.slots.iter().position(|s| s.pid == 0));
            let Some(idx) = idx else {
                return false;
            };
            let old = mem::replace(&mut st.slots[idx].mib, mib);
            st.slots[idx].pid = pid;
            st.reserved = st
                .reserved
                .saturating_sub(old.into())
                .saturating_add(mib.into());
            true
        }

        /// See the POSIX variant.
        pub(crate) fn release(&self, pid: Pid, mib: Mib) {
            let new = slot_mib(mib);
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(idx) = st.slots.iter().position(|s| s.pid == pid) else {
                return;
            };
            let old = mem::replace(&mut st.slots[idx].mib, new);
            if new == 0 {
                st.slots[idx].pid = 0;
            }
            st.reserved = st
                .reserved
                .saturating_sub(old.into())
                .saturating_add(new.into());
        }

        /// See the POSIX variant.
        pub(crate) fn hand_back(&self, pid: Pid, amount: Mib) {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(idx) = st.slots.iter().position(|s| s.pid == pid) else {
                return;
            };
            let old = st.slots[idx].mib;
            let new = old.saturating_sub(slot_mib(amount));
            st.slots[idx].mib = new;
            if new == 0 {
                st.slots[idx].pid = 0;
            }
            st.reserved = st
                .reserved
                .saturating_sub(old.into())
                .saturating_add(new.into());
        }

        /// See the POSIX variant.
        pub(crate) fn totals(&self) -> Totals {
            Totals {
                reserved: Mib(self.state().reserved),
                unused_peaks: Mib(self.unused_peaks.load(Ordering::Acquire)),
            }
        }

        /// See the POSIX variant.
        pub(crate) fn publish_unused_peaks(&self, mib: Mib) {
            self.unused_peaks.store(mib.as_u64(), Ordering::Release);
        }

        /// See the POSIX variant.
        pub(crate) fn table_reserved(&self) -> Mib {
            self.state()
                .slots
                .iter()
                .filter(|s| s.pid != 0)
                .map(|s| Mib(s.mib.into()))
                .sum()
        }

        /// See the POSIX variant.
        pub(crate) fn repair_reserved(&self, table_sum: Mib) {
            self.state().reserved = table_sum.as_u64();
        }

        /// See the POSIX variant.
        pub(crate) fn live_slots(&self) -> usize {
            self.state().slots.iter().filter(|s| s.pid != 0).count()
        }

        /// See the POSIX variant.
        #[cfg(test)]
        pub(crate) fn holds_slot(&self, pid: Pid) -> bool {
            self.state().slots.iter().any(|s| s.pid == pid)
        }
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

    #[test]
    fn reserve_release_round() {
        let region = AccountingRegion::anonymous();
        assert_eq!(region.totals(), Totals::default());

        assert!(region.reserve(100, Mib(512)));
        assert_eq!(region.totals().reserved, Mib(512));
        assert_eq!(region.live_slots(), 1);

        region.release(100, Mib::ZERO);
        assert_eq!(region.totals().reserved, Mib::ZERO);
        assert_eq!(region.live_slots(), 0);
        assert!(!region.holds_slot(100));
    }

    #[test]
    fn reserve_is_idempotent_per_pid() {
        let region = AccountingRegion::anonymous();
        assert!(region.reserve(100, Mib(200)));
        assert!(region.reserve(100, Mib(200)));
        assert_eq!(region.totals().reserved, Mib(200));
        assert_eq!(region.live_slots(), 1);

        // A different value overwrites, it doesn't accumulate.
        assert!(region.reserve(100, Mib(350)));
        assert_eq!(region.totals().reserved, Mib(350));
    }

    #[test]
    fn positive_release_refines() {
        let region = AccountingRegion::anonymous();
        assert!(region.reserve(100, Mib(500)));
        region.release(100, Mib(300));
        assert_eq!(region.totals().reserved, Mib(300));
        assert_eq!(region.live_slots(), 1);
    }

    #[test]
    fn hand_back_partial_then_free() {
        let region = AccountingRegion::anonymous();
        assert!(region.reserve(100, Mib(500)));
        assert!(region.reserve(200, Mib(100)));

        region.hand_back(100, Mib(200));
        assert_eq!(region.totals().reserved, Mib(400));
        assert_eq!(region.live_slots(), 2);

        // Handing back more than remains clamps and frees the slot.
        region.hand_back(100, Mib(999));
        assert_eq!(region.totals().reserved, Mib(100));
        assert_eq!(region.live_slots(), 1);
        assert!(!region.holds_slot(100));

        // Handing back from a pid with no slot is a no-op.
        region.hand_back(300, Mib(50));
        assert_eq!(region.totals().reserved, Mib(100));
    }

    #[test]
    fn full_table_fails_gracefully_and_slots_are_reused() {
        let region = AccountingRegion::anonymous();
        for i in 0..MAX_RESERVATIONS {
            let pid = u32::try_from(i + 1).unwrap();
            assert!(region.reserve(pid, Mib(1)));
        }
        assert!(!region.reserve(9999, Mib(1)));
        assert_eq!(region.live_slots(), MAX_RESERVATIONS);

        // Free one slot; the next reservation takes it.
        region.release(7, Mib::ZERO);
        assert!(region.reserve(9999, Mib(2)));
        assert_eq!(region.live_slots(), MAX_RESERVATIONS);
        assert_eq!(
            region.totals().reserved,
            Mib((MAX_RESERVATIONS as u64 - 1) + 2)
        );
    }

    #[test]
    fn table_and_scalar_agree() {
        let region = AccountingRegion::anonymous();
        assert!(region.reserve(1, Mib(10)));
        assert!(region.reserve(2, Mib(20)));
        region.hand_back(1, Mib(5));
        region.release(3, Mib::ZERO); // unknown pid, no-op
        assert_eq!(region.table_reserved(), region.totals().reserved);

        region.repair_reserved(Mib(123));
        assert_eq!(region.totals().reserved, Mib(123));
        region.repair_reserved(region.table_reserved());
        assert_eq!(region.totals().reserved, Mib(25));
    }

    #[test]
    fn unused_peaks_published() {
        let region = AccountingRegion::anonymous();
        region.publish_unused_peaks(Mib(77));
        assert_eq!(region.totals().unused_peaks, Mib(77));
        assert_eq!(
            region.totals().imminent(),
            Mib(77),
        );
        assert!(region.reserve(1, Mib(3)));
        assert_eq!(region.totals().imminent(), Mib(80));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn shared_object_round_trip() {
        // Two handles onto one named object see each other's accounting,
        // the way a top-level build and a sub-build do.
        let name = format!("/remake_test_{}", std::process::id());
        let top = AccountingRegion::open_shared(&name, Role::TopLevel).unwrap();
        let sub = AccountingRegion::open_shared(&name, Role::SubBuild).unwrap();

        assert!(top.reserve(41, Mib(100)));
        assert_eq!(sub.totals().reserved, Mib(100));

        assert!(sub.reserve(42, Mib(50)));
        assert_eq!(top.totals().reserved, Mib(150));
        assert_eq!(top.table_reserved(), Mib(150));

        sub.release(41, Mib::ZERO);
        assert_eq!(top.totals().reserved, Mib(50));

        // `top` unlinks the name when dropped.
        drop(sub);
        drop(top);
        let stale = AccountingRegion::open_shared(&name, Role::SubBuild);
        assert!(stale.is_err());
    }
}
