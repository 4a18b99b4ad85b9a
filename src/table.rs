//! The table: a fixed-capacity slot array with migration metadata.
//!
//! A table never moves and never grows; changing capacity means building a successor table and
//! migrating into it. Everything here besides the slot array itself exists to coordinate that
//! migration: the block-work counter pair which hands out zeroing and copying work to whichever
//! threads show up, and the retirement chain which parks superseded tables until they can be
//! reclaimed.

use std::alloc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::{cmp, ptr, thread};

use crossbeam_utils::CachePadded;

use crate::keys::KeyOps;
use crate::sentinel::MOVED;
use crate::slot::Slot;

/// The number of slots one unit of cooperative work covers.
///
/// Zeroing and migrating a table is partitioned into blocks of this many slots, claimed one at a
/// time by the participating threads.
pub(crate) const BLOCK_SIZE: usize = 8192;

/// The result of probing a table for a key.
pub(crate) enum Lookup {
    /// No mapping: the chain ended, or the key only has a tombstone.
    Absent,
    /// The mapped value.
    Found(*mut u8),
    /// The probe ran into a migrated slot; finish the migration and retry on the successor.
    Moved,
}

/// A fixed-capacity, power-of-two array of slots.
pub(crate) struct Table {
    /// The number of slots; always a power of two.
    len: usize,
    /// `len - 1`; indexing is `hash & mask`.
    mask: usize,
    /// The slot array, allocated raw and zero-initialized by cooperative block work.
    slots: *mut Slot,
    /// The chain of superseded tables awaiting retirement, newest first.
    prev: AtomicPtr<Table>,
    /// The next block index to hand out.
    ///
    /// The counter pair serves zeroing while the table is new and, after a reset, migration when
    /// it is superseded. Once the table is retired the field is repurposed once more, as the
    /// retirement timestamp. It sits on its own cache line, away from `done`: every participating
    /// thread hammers both, and false sharing between them would serialize the cohort.
    todo: CachePadded<AtomicUsize>,
    /// The number of blocks fully processed; on its own cache line like `todo`.
    done: CachePadded<AtomicUsize>,
}

impl Table {
    /// Allocate a table with `len` slots, leaving the slots uninitialized.
    ///
    /// The slots hold garbage until the zero work has run; the table must not be probed before
    /// that.
    pub unsafe fn alloc(len: usize) -> *mut Table {
        debug_assert!(len.is_power_of_two(), "Table length is not a power of two.");

        let layout = alloc::Layout::array::<Slot>(len).expect("slot array layout overflow");
        let slots = alloc::alloc(layout) as *mut Slot;
        if slots.is_null() {
            alloc::handle_alloc_error(layout);
        }

        Box::into_raw(Box::new(Table {
            len,
            mask: len - 1,
            slots,
            prev: AtomicPtr::default(),
            todo: CachePadded::new(AtomicUsize::new(0)),
            done: CachePadded::new(AtomicUsize::new(0)),
        }))
    }

    /// Free a table and its slot array.
    ///
    /// Keys and values are not touched; the caller has already made sure no slot owns anything.
    pub unsafe fn dealloc(table: *mut Table) {
        let table = Box::from_raw(table);
        alloc::dealloc(
            table.slots as *mut u8,
            alloc::Layout::array::<Slot>(table.len).expect("slot array layout overflow"),
        );
    }

    /// The number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The index mask.
    pub fn mask(&self) -> usize {
        self.mask
    }

    /// Get the slot at `idx`.
    pub fn slot(&self, idx: usize) -> &Slot {
        debug_assert!(idx < self.len, "Slot index out of bounds.");

        unsafe { &*self.slots.add(idx) }
    }

    /// The retirement chain head (the most recently superseded table).
    pub fn prev(&self) -> &AtomicPtr<Table> {
        &self.prev
    }

    /// The number of work blocks this table partitions into.
    pub fn blocks(&self) -> usize {
        (self.len + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    /// The slot range of `block`.
    pub fn block_range(&self, block: usize) -> (usize, usize) {
        let start = block * BLOCK_SIZE;
        (start, cmp::min(start + BLOCK_SIZE, self.len))
    }

    /// Claim the next unprocessed block.
    ///
    /// Returns `None` when every block has been handed out. In that case the call waits (with
    /// yield) until the whole cohort has acknowledged its blocks, so `None` also means the work is
    /// globally complete.
    pub fn claim_block(&self) -> Option<usize> {
        let block = self.todo.fetch_add(1, Ordering::Relaxed);
        if block < self.blocks() {
            return Some(block);
        }

        // Nothing left to hand out; wait for the stragglers.
        while self.done.load(Ordering::Acquire) < self.blocks() {
            thread::yield_now();
        }
        None
    }

    /// Acknowledge a processed block.
    ///
    /// Returns true when this was the last outstanding block, i.e. the whole round of work is
    /// complete. The release half pairs with the acquire in `claim_block`'s wait, which is what
    /// lets a thread move from zeroing to migrating knowing the zeroes have landed. The acquire
    /// half matters to the thread whose increment completes the round: blocks are written
    /// non-atomically, and that thread returns straight to the table without ever passing
    /// through `claim_block`'s waiting load, so it must synchronize with the other
    /// acknowledgements here.
    pub fn finish_block(&self) -> bool {
        self.done.fetch_add(1, Ordering::AcqRel) + 1 == self.blocks()
    }

    /// Rewind the block counters for a new round of work.
    ///
    /// The resize winner calls this before announcing the table as a migration source; the
    /// release on the in-progress pointer publishes the reset along with everything else.
    pub fn reset_blocks(&self) {
        self.todo.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    /// Zero-initialize the slots of `block`.
    ///
    /// The all-zero byte pattern is a valid free slot.
    pub unsafe fn zero_block(&self, block: usize) {
        let (start, end) = self.block_range(block);
        ptr::write_bytes(self.slots.add(start), 0, end - start);
    }

    /// Participate in zeroing this (new, not yet probed) table until the work is complete.
    pub unsafe fn zero_work(&self) {
        while let Some(block) = self.claim_block() {
            self.zero_block(block);
            if self.finish_block() {
                break;
            }
        }
    }

    /// Stamp this (superseded, fully migrated) table with its retirement time.
    ///
    /// The block counter has served both of its purposes by now, so it becomes the timestamp
    /// store. A straggling helper may still bump it by a few units, which only postpones the
    /// reclamation; that is the harmless direction.
    pub fn stamp_retirement(&self, now: u64) {
        self.todo.store(now as usize, Ordering::Relaxed);
    }

    /// The retirement timestamp of this table.
    pub fn retired_at(&self) -> u64 {
        self.todo.load(Ordering::Relaxed) as u64
    }

    /// Probe for `key`, whose memoized hash is `hash`.
    ///
    /// Linear probing from `hash & mask`. A free slot terminates the chain (inserters always
    /// publish the key before anything else, so no mapping can hide behind one), and a full sweep
    /// of the table concludes absence as well. The memoized hash is checked before the caller's
    /// equality, which may be arbitrarily expensive.
    pub unsafe fn lookup(&self, key: *const u8, hash: u32, ops: &KeyOps) -> Lookup {
        let mut idx = hash as usize & self.mask;

        for _ in 0..self.len {
            let slot = self.slot(idx);

            let k = slot.key();
            if k.is_null() {
                // The chain ends here; the key cannot be further down.
                return Lookup::Absent;
            }
            if k == MOVED {
                return Lookup::Moved;
            }

            if slot.hash() == hash && (ops.eq)(k, key) {
                let val = slot.val();
                if val == MOVED {
                    // The entry went on to the successor table.
                    return Lookup::Moved;
                }
                return if val.is_null() {
                    // A tombstone: the key is parked, the mapping is gone.
                    Lookup::Absent
                } else {
                    Lookup::Found(val)
                };
            }

            idx = (idx + 1) & self.mask;
        }

        Lookup::Absent
    }
}
