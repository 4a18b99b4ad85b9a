//! The slot: one key-hash-value triple.
//!
//! A slot runs through a small state machine:
//!
//! - **Free**: the key is null. The slot has never held anything, and it terminates every probe
//!   chain crossing it.
//! - **Claimed**: the key is set, the memoized hash is still zero. The claimer owns the slot until
//!   it publishes the hash; everyone else (readers, racing writers, migration) waits on the hash.
//! - **Live**: key and hash are set. The value is either null (a tombstone: the mapping is gone,
//!   but the key stays parked here) or a caller value. The value field is the only one which keeps
//!   changing, and always by CAS.
//! - **Moved**: the slot belongs to a superseded table. Either the key is `MOVED` (the slot was
//!   sealed while free, or its entry was discarded as a tombstone during migration), or the value
//!   is `MOVED` (the entry went on to the successor table). Both shapes are terminal.
//!
//! The key field transitions at most twice (null → key → `MOVED`) and the hash field at most
//! once (0 → nonzero). Caller hashes of 0 are remapped before they reach a slot, which frees 0
//! to mean "not yet published".

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::{ptr, thread};

use crate::sentinel::MOVED;

/// One entry of a table.
///
/// The all-zero byte pattern is a valid (free) slot, so tables can be materialized by zeroing raw
/// memory.
#[derive(Default)]
pub(crate) struct Slot {
    /// The key pointer; null while the slot is free, `MOVED` once sealed.
    key: AtomicPtr<u8>,
    /// The memoized key hash; 0 until the claimer publishes it.
    hash: AtomicU32,
    /// The value pointer; null is the tombstone, `MOVED` marks a migrated entry.
    val: AtomicPtr<u8>,
}

impl Slot {
    /// Read the key.
    pub fn key(&self) -> *mut u8 {
        self.key.load(Ordering::Acquire)
    }

    /// Try to claim a free slot with `key`.
    ///
    /// On success the calling thread owns the slot until it publishes the hash. The release pairs
    /// with the acquire of `key()`, so whoever sees the pointer also sees the key's bytes. On
    /// failure the actual key is returned.
    pub fn claim(&self, key: *mut u8) -> Result<(), *mut u8> {
        self.key
            .compare_exchange(ptr::null_mut(), key, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Reconfirm that the slot is free, at a single point in time.
    ///
    /// A plain load has already seen the slot free when this is called; the no-op CAS turns that
    /// stale observation into a linearization point.
    pub fn confirm_free(&self) -> bool {
        self.key
            .compare_exchange(
                ptr::null_mut(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Seal the key field, transitioning `from` to `MOVED`.
    ///
    /// Migration uses this to finalize free slots (`from` null) and discarded tombstones (`from`
    /// the dead key).
    pub fn seal_key(&self, from: *mut u8) -> bool {
        self.key
            .compare_exchange(from, MOVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wait for the memoized hash of an occupied slot.
    ///
    /// Spins (with yield) while the claimer is between claiming the key and publishing the hash.
    /// The acquire pairs with `publish_hash`, so a nonzero return means the slot is fully
    /// constructed.
    pub fn hash(&self) -> u32 {
        loop {
            let hash = self.hash.load(Ordering::Acquire);
            if hash != 0 {
                return hash;
            }
            // The claimer is mid-publication.
            thread::yield_now();
        }
    }

    /// Publish the memoized hash, opening the slot to everyone else.
    pub fn publish_hash(&self, hash: u32) {
        debug_assert_ne!(hash, 0, "Publishing the reserved hash.");

        self.hash.store(hash, Ordering::Release);
    }

    /// Read the value.
    pub fn val(&self) -> *mut u8 {
        self.val.load(Ordering::Acquire)
    }

    /// Set the value of a slot claimed by this thread.
    ///
    /// Only legal between `claim` and `publish_hash`: the hash handshake keeps every other writer
    /// out, so the exchange from null cannot be contested.
    pub fn set_initial(&self, val: *mut u8) {
        let _res =
            self.val
                .compare_exchange(ptr::null_mut(), val, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(_res.is_ok(), "Initial value of a claimed slot was contested.");
    }

    /// CAS the value from `old` to `new`.
    ///
    /// On failure the actual value is returned.
    pub fn update(&self, old: *mut u8, new: *mut u8) -> Result<(), *mut u8> {
        self.val
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Seal the value field, transitioning `old` to `MOVED`.
    ///
    /// On failure the actual value is returned.
    pub fn seal_val(&self, old: *mut u8) -> Result<(), *mut u8> {
        self.update(old, MOVED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> *mut u8 {
        Box::into_raw(Box::new(0u8))
    }

    #[test]
    fn claim_and_publish() {
        let slot = Slot::default();
        let k = key();

        assert_eq!(slot.claim(k), Ok(()));
        assert_eq!(slot.key(), k);
        // A second claimer loses and reads the winner.
        assert_eq!(slot.claim(key()), Err(k));

        slot.set_initial(0x100 as *mut u8);
        slot.publish_hash(77);
        assert_eq!(slot.hash(), 77);
        assert_eq!(slot.val(), 0x100 as *mut u8);
    }

    #[test]
    fn confirm_free_is_a_point_in_time() {
        let slot = Slot::default();
        assert!(slot.confirm_free());

        assert_eq!(slot.claim(key()), Ok(()));
        assert!(!slot.confirm_free());
    }

    #[test]
    fn value_updates() {
        let slot = Slot::default();
        slot.claim(key()).unwrap();
        slot.set_initial(0x100 as *mut u8);
        slot.publish_hash(1);

        assert_eq!(slot.update(0x100 as *mut u8, 0x200 as *mut u8), Ok(()));
        assert_eq!(
            slot.update(0x100 as *mut u8, 0x300 as *mut u8),
            Err(0x200 as *mut u8)
        );

        assert_eq!(slot.seal_val(0x200 as *mut u8), Ok(()));
        assert_eq!(slot.val(), MOVED);
    }

    #[test]
    fn seal_free_slot() {
        let slot = Slot::default();
        assert!(slot.seal_key(ptr::null_mut()));
        assert_eq!(slot.key(), MOVED);
        // Sealed slots are gone for good.
        assert!(!slot.confirm_free());
        assert!(slot.claim(key()).is_err());
    }
}
