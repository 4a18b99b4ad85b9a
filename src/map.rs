//! The map: the public handle and the migration machinery.
//!
//! The map holds the live table, the successor table of a resize in flight, the bookkeeping
//! counters, and the caller's key capabilities. Everything stateful happens here: conditional
//! updates, the election and execution of resizes, cooperative migration, and the retirement of
//! superseded tables.

use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{cmp, ptr, thread};

use crate::debug;
use crate::keys::KeyOps;
use crate::sentinel::{self, ALLOCATING, MATCH_ANY, MOVED};
use crate::table::{Lookup, Table};

/// The probe bound of inserting operations.
///
/// When an insert has to walk further than this, the table is either too full or too clustered
/// with dead entries; instead of feeding the chain, the table is replaced.
const REPROBE_LIMIT: usize = 17;

/// The initial table capacity of `Map::new`.
const MIN_CAPACITY: usize = 4;

/// How long a superseded table is retained before it may be freed, in seconds.
///
/// Threads can keep probing a superseded table long after its migration finished, and they hold
/// no guard which would make that visible. Reclamation is therefore deferred by a window which
/// any such probe will have left ages ago.
const RETIRE_WINDOW: u64 = 30;

/// The internal outcome of a conditional update against one table.
enum Put {
    /// The operation is done; this is the value mapped immediately before it took effect (null:
    /// the mapping was absent), which is also what goes back to the caller.
    Prior(*mut u8),
    /// The table is being superseded; help the migration and retry on the successor.
    Moved,
    /// Migration only: the migrated entry was a tombstone, so nothing was inserted, and the
    /// copier should seal the old slot and destroy the key.
    Discard,
}

/// A lock-free, open-addressing concurrent hash table of opaque pointers.
///
/// Any number of threads may read and update the map at the same time; no operation ever takes a
/// lock. See the crate documentation for the design and [`KeyOps`] for the contract on the key
/// capabilities.
///
/// # Ownership
///
/// Keys passed to [`put_if`](Map::put_if) (and its wrappers) are owned by the map from the call
/// boundary on, unconditionally: the map either stores the key or destroys it, exactly once, even
/// when the operation itself does not take effect. Keys passed to [`get`](Map::get) are only
/// borrowed. Values are opaque words to the map; it never dereferences or destroys one.
pub struct Map {
    /// The live table.
    current: AtomicPtr<Table>,
    /// The successor table of a resize in flight.
    ///
    /// Null when no resize is running, `ALLOCATING` while the winner allocates, otherwise the new
    /// table being zeroed and filled.
    next: AtomicPtr<Table>,
    /// The number of live mappings.
    ///
    /// Signed: the increments and decrements of racing operations can be observed out of order,
    /// so the counter may transiently dip below zero. Reads clamp.
    size: AtomicIsize,
    /// The number of successful value updates since the last resize.
    ///
    /// Purely a heuristic for the grow-versus-compact decision; lost updates do not matter.
    changes: AtomicUsize,
    /// The caller-supplied key capabilities.
    ops: KeyOps,
}

// The raw pointers inside are managed per the protocol above; what crosses threads beyond them
// are the capabilities, which are plain function pointers.
unsafe impl Send for Map {}
unsafe impl Sync for Map {}

impl Map {
    /// Create a map with the given key capabilities.
    pub fn new(ops: KeyOps) -> Map {
        Map::with_capacity(ops, MIN_CAPACITY)
    }

    /// Create a map with at least `cap` slots.
    ///
    /// The capacity is rounded up to a power of two, with a small floor.
    pub fn with_capacity(ops: KeyOps, cap: usize) -> Map {
        let cap = cmp::max(cap, MIN_CAPACITY).next_power_of_two();

        let table = unsafe {
            let table = Table::alloc(cap);
            // There is no one to share the zeroing with yet.
            (*table).zero_work();
            table
        };

        Map {
            current: AtomicPtr::new(table),
            next: AtomicPtr::default(),
            size: AtomicIsize::new(0),
            changes: AtomicUsize::new(0),
            ops,
        }
    }

    /// The number of live mappings.
    ///
    /// This may lag concurrent updates; after quiescence it equals the number of mappings exactly.
    pub fn size(&self) -> usize {
        cmp::max(self.size.load(Ordering::Relaxed), 0) as usize
    }

    /// The slot count of the live table.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.current.load(Ordering::Acquire)).len() }
    }

    /// Hash a key through the caller capability, keeping 0 reserved for the slot handshake.
    unsafe fn hash_key(&self, key: *const u8) -> u32 {
        match (self.ops.hash)(key) {
            0 => 1,
            hash => hash,
        }
    }

    /// Look up the value mapped to `key`.
    ///
    /// Returns null when there is no mapping. The key is borrowed; the caller keeps ownership of
    /// it.
    ///
    /// # Safety
    ///
    /// `key` must be a pointer the capabilities can hash and compare.
    pub unsafe fn get(&self, key: *const u8) -> *mut u8 {
        let hash = self.hash_key(key);

        loop {
            let table = self.current.load(Ordering::Acquire);
            match (*table).lookup(key, hash, &self.ops) {
                Lookup::Found(val) => return val,
                Lookup::Absent => return ptr::null_mut(),
                // The probe ran into a migrated slot: lend a hand, then try the successor.
                Lookup::Moved => self.help_copy(),
            }
        }
    }

    /// Conditionally update the mapping of `key`.
    ///
    /// When the currently mapped value equals `oldval` (null means "absent", [`MATCH_ANY`]
    /// matches everything), the mapping is set to `val`, where null deletes the mapping.
    /// Returns the value mapped immediately before the operation, whether or not it took
    /// effect; comparing the return against `oldval` tells which.
    ///
    /// Ownership of `key` transfers to the map on the call boundary, unconditionally.
    ///
    /// # Safety
    ///
    /// `key` must be a pointer the capabilities can hash, compare, and destroy, and must not be
    /// one of the tag addresses. `val` must be null or a pointer distinct from the tag addresses;
    /// the map never dereferences it.
    pub unsafe fn put_if(&self, key: *mut u8, val: *mut u8, oldval: *mut u8) -> *mut u8 {
        debug_assert!(sentinel::is_real(key), "Inserting a tag pointer as key.");
        debug_assert!(
            val.is_null() || sentinel::is_real(val),
            "Inserting a tag pointer as value."
        );
        debug_assert!(oldval != MOVED, "Expecting a tag pointer as prior value.");

        let hash = self.hash_key(key);

        loop {
            let table = self.current.load(Ordering::Acquire);
            match self.put_if_table(table, key, hash, val, oldval, false) {
                Put::Prior(prior) => return prior,
                Put::Moved => self.help_copy(),
                Put::Discard => unreachable!("tombstone discard outside of migration"),
            }
        }
    }

    /// Map `key` to `val`, unconditionally.
    ///
    /// Ownership of `key` transfers to the map. Returns the previously mapped value, if any.
    ///
    /// # Safety
    ///
    /// As for [`put_if`](Map::put_if).
    pub unsafe fn insert(&self, key: *mut u8, val: *mut u8) -> *mut u8 {
        self.put_if(key, val, MATCH_ANY)
    }

    /// Remove the mapping of `key`, unconditionally.
    ///
    /// The key is only used to find the mapping, but is absorbed like any other `put_if` key.
    /// Returns the removed value, if any.
    ///
    /// # Safety
    ///
    /// As for [`put_if`](Map::put_if).
    pub unsafe fn remove(&self, key: *mut u8) -> *mut u8 {
        self.put_if(key, ptr::null_mut(), MATCH_ANY)
    }

    /// Run a conditional update against one table.
    ///
    /// `copying` marks migration reinserts. Those are already accounted for in the size, must
    /// not trigger nested resizes, and report tombstones back to the copier instead of touching
    /// the key.
    unsafe fn put_if_table(
        &self,
        table: *mut Table,
        key: *mut u8,
        hash: u32,
        val: *mut u8,
        oldval: *mut u8,
        copying: bool,
    ) -> Put {
        let t = &*table;
        let mut idx = hash as usize & t.mask();
        let mut reprobes = 0;

        // Phase one: find the key, or claim a free slot for it.
        let slot = loop {
            let slot = t.slot(idx);

            let k = slot.key();
            if k.is_null() {
                // The chain ends here, so the mapping does not exist.
                if val.is_null() && (oldval.is_null() || oldval == MATCH_ANY) {
                    // Deleting an absent mapping is a no-op, provided the slot still is free at
                    // one well-defined instant.
                    if !slot.confirm_free() {
                        // Lost to a racing claimer; reexamine the slot.
                        continue;
                    }
                    if copying {
                        return Put::Discard;
                    }
                    (self.ops.destroy)(key);
                    return Put::Prior(ptr::null_mut());
                }

                if slot.claim(key).is_err() {
                    // Someone else claimed the slot first; reexamine it.
                    continue;
                }

                // The slot is ours until the hash goes up: readers, racing writers and migration
                // all wait on the handshake. The value is resolved inside that window, which is
                // what keeps migration from ever seeing a claim as a tombstone and destroying a
                // key whose operation is still in flight.
                let matched = oldval.is_null() || oldval == MATCH_ANY;
                if matched {
                    slot.set_initial(val);
                }
                slot.publish_hash(hash);

                if matched && !copying {
                    if !val.is_null() {
                        self.size.fetch_add(1, Ordering::Relaxed);
                    }
                    self.changes.fetch_add(1, Ordering::Relaxed);
                }
                // On a constraint miss the key stays parked in a dead slot; compaction collects
                // it later. Either way the prior mapping was absent.
                return Put::Prior(ptr::null_mut());
            }

            if k == MOVED {
                return Put::Moved;
            }

            if slot.hash() == hash && (self.ops.eq)(k, key) {
                // The key already lives here; the caller's copy of it is redundant.
                break slot;
            }

            reprobes += 1;
            if !copying && reprobes >= REPROBE_LIMIT {
                // The chain has grown past the bound; replace the table rather than feed it. The
                // caller helps and retries on the successor.
                self.resize(table);
                return Put::Moved;
            }
            idx = (idx + 1) & t.mask();
        };

        // Phase two: the slot holds an equal key; update its value.
        let mut current = slot.val();
        loop {
            if current == MOVED {
                // The entry went on to the successor table.
                return Put::Moved;
            }

            if !copying {
                // Opportunistic abandon: once a successor is being filled, updates to this table
                // are wasted work which the migration would have to chase.
                let next = self.next.load(Ordering::Acquire);
                if !next.is_null() && next != ALLOCATING && next != table {
                    return Put::Moved;
                }
            }

            if oldval != MATCH_ANY && current != oldval {
                // Constraint miss: the mapping stays untouched. The caller's key is absorbed
                // regardless, per the ownership contract.
                if !copying {
                    (self.ops.destroy)(key);
                }
                return Put::Prior(current);
            }

            match slot.update(current, val) {
                Ok(()) => {
                    if !copying {
                        // Only transitions between absent and present move the size.
                        if current.is_null() && !val.is_null() {
                            self.size.fetch_add(1, Ordering::Relaxed);
                        } else if !current.is_null() && val.is_null() {
                            self.size.fetch_sub(1, Ordering::Relaxed);
                        }
                        self.changes.fetch_add(1, Ordering::Relaxed);
                        // The stored key stays; the caller's duplicate dies.
                        (self.ops.destroy)(key);
                    }
                    return Put::Prior(current);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Replace `table` with a successor, migrating every entry into it.
    ///
    /// Any number of threads race into this when their probes overflow; one wins the allocation
    /// and the rest back off into helping. The winner drives the whole cycle: allocate, zero,
    /// migrate, retire the old table, promote the new one.
    unsafe fn resize(&self, table: *mut Table) {
        // Back off when a resize is already under way, or the trigger is stale.
        if !self.next.load(Ordering::Acquire).is_null() {
            return;
        }
        if self.current.load(Ordering::Acquire) != table {
            return;
        }

        // Elect a winner.
        if self
            .next
            .compare_exchange(
                ptr::null_mut(),
                ALLOCATING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        // The election could have raced a complete resize cycle; recheck the trigger.
        if self.current.load(Ordering::Acquire) != table {
            self.next.store(ptr::null_mut(), Ordering::Release);
            return;
        }

        let old = &*table;

        // Decide the successor capacity: normally double, but a table dominated by dead entries
        // (many updates, few live mappings) is rebuilt at the same length to shed them.
        let len = old.len();
        let live = self.size();
        let changes = self.changes.load(Ordering::Relaxed);
        let new_len = if changes > len / 4 && live * 10 < len * 3 {
            len
        } else {
            len * 2
        };

        debug::exec(|| {
            println!(
                "Resizing {} -> {} (live: {}, changes: {}).",
                len, new_len, live, changes
            )
        });

        // The old table's block counters begin their second career, handing out migration work.
        old.reset_blocks();
        let new = Table::alloc(new_len);
        // Publish the successor; from here on everyone can participate.
        self.next.store(new, Ordering::Release);

        // Drive the migration to completion. Helpers may share the load, but completion is on us.
        (*new).zero_work();
        self.copy_work(table, new);

        // Chain the old table under its successor and see whether older retirees have aged out.
        let now = unix_seconds();
        (*new).prev().store(table, Ordering::Relaxed);
        old.stamp_retirement(now);
        self.sweep_retired(new, now);

        // Promote. Only the winner performs these transitions, so they cannot fail.
        if self
            .current
            .compare_exchange(table, new, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("Resize winner lost the table promotion; the map is corrupt.");
        }
        if self
            .next
            .compare_exchange(new, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("Resize winner lost the in-progress handover; the map is corrupt.");
        }

        self.changes.store(0, Ordering::Relaxed);

        debug::exec(|| println!("Promoted the {}-slot table.", new_len));
    }

    /// Help an in-flight resize along, returning once the successor has been promoted (or no
    /// resize is running anymore).
    ///
    /// First the new table's zeroing is drained, then the old table's migration, then we wait for
    /// the winner to promote. The waits cannot stall forever: the winner performs the same work
    /// itself, so its progress does not depend on anyone else.
    unsafe fn help_copy(&self) {
        loop {
            let new = self.next.load(Ordering::Acquire);
            if new.is_null() {
                // Nothing in flight; whatever we raced has completed.
                return;
            }
            if new == ALLOCATING {
                // The winner is still allocating; the table shows up in a moment.
                thread::yield_now();
                continue;
            }

            let old = self.current.load(Ordering::Acquire);
            if old == new {
                // Read between promotion and the in-progress handover; everything is copied.
                return;
            }
            // The two loads above could span a whole resize cycle. Only a stable pair identifies
            // an actual migration source and target.
            if self.next.load(Ordering::Acquire) != new {
                continue;
            }

            (*new).zero_work();
            self.copy_work(old, new);

            // Every slot is migrated; the winner promotes in a moment.
            while self.current.load(Ordering::Acquire) == old {
                thread::yield_now();
            }
            return;
        }
    }

    /// Participate in migrating `old` into `new` until every block is acknowledged.
    unsafe fn copy_work(&self, old: *mut Table, new: *mut Table) {
        while let Some(block) = (*old).claim_block() {
            let (start, end) = (*old).block_range(block);
            for idx in start..end {
                self.copy_slot(old, new, idx);
            }
            if (*old).finish_block() {
                break;
            }
        }
    }

    /// Migrate slot `idx` of `old` into `new`, leaving the slot sealed.
    unsafe fn copy_slot(&self, old: *mut Table, new: *mut Table, idx: usize) {
        let slot = (*old).slot(idx);

        loop {
            let k = slot.key();
            if k.is_null() {
                // Seal free slots, so nothing can be inserted behind the migration's back.
                if slot.seal_key(ptr::null_mut()) {
                    return;
                }
                // A claim slipped in; treat the slot as occupied.
                continue;
            }
            if k == MOVED {
                // Nothing left to do here.
                return;
            }

            // An occupied slot: freeze the value, then reinsert the entry into the successor.
            // Reading the hash synchronizes with the claimer, so the value frozen below is the
            // one its operation committed (or a later one), never an in-flight intermediate.
            let hash = slot.hash();
            let mut val = slot.val();
            loop {
                match slot.seal_val(val) {
                    Ok(()) => break,
                    Err(actual) => {
                        debug_assert_ne!(actual, MOVED, "Slot migrated by a second copier.");
                        val = actual;
                    }
                }
            }

            if let Put::Discard = self.put_if_table(new, k, hash, val, ptr::null_mut(), true) {
                // The entry was a tombstone: nothing went over, and the parked key dies with the
                // old table's chain position.
                let _sealed = slot.seal_key(k);
                debug_assert!(_sealed, "A sealed entry changed its key.");
                (self.ops.destroy)(k);
            }
            // Otherwise the entry, key included, lives in the successor now; the slot keeps the
            // stale key pointer behind its sealed value.
            return;
        }
    }

    /// Free every table in `newest`'s retirement chain which has been retired for longer than the
    /// retention window.
    ///
    /// The chain is ordered newest-first, so the first table old enough takes everything behind
    /// it along. Only the resize winner walks the chain, one winner at a time, so plain stores
    /// suffice.
    unsafe fn sweep_retired(&self, newest: *mut Table, now: u64) {
        let mut parent = newest;
        loop {
            let table = (*parent).prev().load(Ordering::Relaxed);
            if table.is_null() {
                return;
            }

            if now.saturating_sub((*table).retired_at()) > RETIRE_WINDOW {
                // Unlink the tail and free it.
                (*parent).prev().store(ptr::null_mut(), Ordering::Relaxed);

                let mut table = table;
                while !table.is_null() {
                    let older = (*table).prev().load(Ordering::Relaxed);
                    let len = (*table).len();
                    debug::exec(|| println!("Reclaiming a retired {}-slot table.", len));
                    Table::dealloc(table);
                    table = older;
                }
                return;
            }

            parent = table;
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        unsafe {
            debug_assert!(
                self.next.load(Ordering::Relaxed).is_null(),
                "Dropping a map mid-resize; some caller is still active."
            );

            let current = *self.current.get_mut();

            // Superseded tables hold no keys anymore; their memory is all there is to reclaim.
            let mut retired = (*current).prev().load(Ordering::Relaxed);
            while !retired.is_null() {
                let older = (*retired).prev().load(Ordering::Relaxed);
                Table::dealloc(retired);
                retired = older;
            }

            // The live table owns its keys, dead entries included. Values are the caller's.
            for idx in 0..(*current).len() {
                let key = (*current).slot(idx).key();
                if !key.is_null() && key != MOVED {
                    (self.ops.destroy)(key);
                }
            }
            Table::dealloc(current);
        }
    }
}

/// The wall clock, as seconds since the epoch.
fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
