//! Caller-supplied key capabilities.
//!
//! The map knows nothing about its keys. Hashing, equality, and destruction are injected at
//! construction as three function capabilities and stored for the lifetime of the map. The map
//! owns every key it absorbs and runs the destructor exactly once per key, but never looks inside
//! one except through these functions.

use std::hash::{Hash, Hasher};

use seahash::SeaHasher;

/// The key capabilities of a map.
///
/// # Safety
///
/// All three functions are called concurrently, from whichever thread happens to touch the map,
/// and must tolerate that.
///
/// `eq` carries one further obligation: during migration, the key of a deleted entry is destroyed
/// while other threads can still be probing the superseded table, so `eq` may be handed a pointer
/// whose key has already been destroyed. It must run to completion without faulting on such a
/// pointer. Its return value in that case is irrelevant; the prober will subsequently see the
/// migration marker and retry on the new table.
#[derive(Copy, Clone)]
pub struct KeyOps {
    /// Hash a key to 32 bits.
    ///
    /// The map remaps 0 to 1 internally, so the full range may be used. Collisions are legal, but
    /// hash quality dominates probe-chain length and thereby resize behavior.
    pub hash: unsafe fn(*const u8) -> u32,
    /// Compare two keys for equality.
    pub eq: unsafe fn(*const u8, *const u8) -> bool,
    /// Destroy a key whose ownership has ended.
    ///
    /// Called at most once per key the map ever absorbed.
    pub destroy: unsafe fn(*mut u8),
}

impl KeyOps {
    /// Capabilities for keys which are `Box<T>`, handed over as raw pointers.
    ///
    /// Hashing goes through seahash; equality and destruction are the obvious ones. Allocate keys
    /// with [`box_key`] and hand them to the map.
    pub fn boxed<T: Hash + Eq>() -> KeyOps {
        KeyOps {
            hash: hash_boxed::<T>,
            eq: eq_boxed::<T>,
            destroy: destroy_boxed::<T>,
        }
    }
}

/// Move `key` to the heap, in the representation [`KeyOps::boxed`] expects.
pub fn box_key<T>(key: T) -> *mut u8 {
    Box::into_raw(Box::new(key)) as *mut u8
}

/// Hash a boxed key with seahash.
unsafe fn hash_boxed<T: Hash>(key: *const u8) -> u32 {
    let mut hasher = SeaHasher::new();
    (*(key as *const T)).hash(&mut hasher);
    hasher.finish() as u32
}

/// Compare two boxed keys.
unsafe fn eq_boxed<T: Eq>(a: *const u8, b: *const u8) -> bool {
    *(a as *const T) == *(b as *const T)
}

/// Drop a boxed key.
unsafe fn destroy_boxed<T>(key: *mut u8) {
    drop(Box::from_raw(key as *mut T));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxed_roundtrip() {
        unsafe {
            let ops = KeyOps::boxed::<u64>();

            let a = box_key(42u64);
            let b = box_key(42u64);
            let c = box_key(43u64);

            assert_eq!((ops.hash)(a), (ops.hash)(b));
            assert!((ops.eq)(a, b));
            assert!(!(ops.eq)(a, c));

            (ops.destroy)(a);
            (ops.destroy)(b);
            (ops.destroy)(c);
        }
    }

    #[test]
    fn boxed_strings() {
        unsafe {
            let ops = KeyOps::boxed::<String>();

            let a = box_key("hello".to_string());
            let b = box_key("hello".to_string());

            assert_eq!((ops.hash)(a), (ops.hash)(b));
            assert!((ops.eq)(a, b));

            (ops.destroy)(a);
            (ops.destroy)(b);
        }
    }
}
