//! In-band tag pointers.
//!
//! The table stores keys and values as opaque pointers, so it needs a handful of markers which can
//! never collide with anything a caller hands in. Like the trap values of a hazard state, they are
//! a few fixed, low, non-null addresses: no allocator ever hands these out, and the null pointer
//! stays free to mean "nothing here".

use crate::table::Table;

/// A slot (key or value side) which has been migrated to a successor table.
///
/// Observing this tag means the table at hand is dying. The observer finishes the pending
/// migration and retries on the new table. It is never returned to callers, but callers must not
/// use it as a key or value.
pub const MOVED: *mut u8 = 0x8 as *mut u8;

/// The wildcard for the expected prior value of an update.
///
/// Passed as `oldval` to [`Map::put_if`](crate::Map::put_if), this makes the update
/// unconditional.
pub const MATCH_ANY: *mut u8 = 0x10 as *mut u8;

/// The in-progress table pointer of a map whose resize winner is still allocating.
///
/// Losing threads observing this tag know a new table is coming, but not yet where it lives, so
/// they yield until the winner publishes it.
pub(crate) const ALLOCATING: *mut Table = 0x18 as *mut Table;

/// Is this pointer a real, caller-provided key or value?
///
/// Real pointers are anything but null (absent/tombstone) and the tags above.
pub(crate) fn is_real(ptr: *mut u8) -> bool {
    !ptr.is_null() && ptr != MOVED && ptr != MATCH_ANY
}
