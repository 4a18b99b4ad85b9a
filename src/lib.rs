//! A lock-free, open-addressing concurrent hash table.
//!
//! This crate implements a concurrent hash table over opaque pointers: readers and writers on any
//! number of threads, no mutexes, no spin-locks, nothing but atomic loads, stores, and CAS.
//! Updates publish a happens-before edge to subsequent reads of the same mapping.
//!
//! # Design
//!
//! The table is open-addressed with linear probing. A slot is three words: the key pointer, a
//! memoized 32-bit hash, and the value pointer. Claiming a slot is a CAS on the key field; the
//! hash is published second and doubles as the construction handshake, so whoever sees the key
//! but a zero hash yields until the claimer is done. From then on, the value changes by CAS for
//! the rest of the slot's life. Keys never leave a slot: deleting a mapping just nulls the value
//! out (a tombstone), and the dead entries are shed wholesale when the table is rebuilt.
//!
//! When an insert probes too far, the table is replaced. One thread wins the election and
//! allocates a successor of double capacity (or equal capacity, when the table is mostly
//! tombstones), and every thread which runs into the migration chips in: the work is handed out
//! in blocks, first zeroing the new table, then migrating the old one slot by slot. Migrated
//! slots are sealed with a marker; any operation running into a marker helps finish the
//! migration and retries on the successor.
//!
//! Superseded tables are not freed on the spot, since a thread that never noticed the resize can
//! still be probing them. They are parked in a retirement chain under their successor instead,
//! and reclaimed after a generous quiescence window.
//!
//! # Keys, values, and ownership
//!
//! The map does not know what its keys and values are. Hashing, equality and destruction of keys
//! are injected as [`KeyOps`] at construction; the [`KeyOps::boxed`] constructor covers the
//! common case of heap-allocated typed keys.
//!
//! Keys are owned by the map: [`Map::put_if`] transfers ownership on the call boundary, and every
//! absorbed key is destroyed exactly once through the injected destructor, be it when it turns
//! out redundant, when its deleted entry is shed by a migration, or when the map is dropped.
//! Values are only ever borrowed; the map never destroys a value.
//!
//! # Usage
//!
//! ```rust
//! use probing_hashmap::{box_key, KeyOps, Map, MATCH_ANY};
//!
//! let map = Map::new(KeyOps::boxed::<u64>());
//!
//! unsafe {
//!     // The key moves into the map; the value is an opaque pointer the map will neither
//!     // dereference nor free.
//!     map.put_if(box_key(42u64), 0x100 as *mut u8, MATCH_ANY);
//!
//!     let probe = 42u64;
//!     assert_eq!(map.get(&probe as *const u64 as *const u8), 0x100 as *mut u8);
//! }
//! ```
//!
//! # Trade-offs
//!
//! Compared to a lock-based concurrent map, nothing here ever blocks behind a descheduled lock
//! holder: the only waits are short handshakes, and a thread stuck in one can always be overtaken
//! by everyone else making progress elsewhere. The price is a weaker reclamation story: retired
//! tables are reclaimed on a timer rather than by tracking readers, and the key of a deleted
//! entry can be destroyed while a straggling probe still compares against it, which is why
//! [`KeyOps`] spells out that the equality capability must tolerate destroyed keys. A
//! hazard-pointer scheme would close both holes at the cost of per-read bookkeeping.

#![deny(missing_docs)]

mod debug;
mod keys;
mod map;
mod sentinel;
mod slot;
mod table;
#[cfg(test)]
mod tests;

pub use crate::keys::{box_key, KeyOps};
pub use crate::map::Map;
pub use crate::sentinel::{MATCH_ANY, MOVED};
