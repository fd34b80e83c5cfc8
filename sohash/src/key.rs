//! Split-order key arithmetic.
//!
//! Every entry lives in a single list ordered by the bit-reversed form of its
//! key. Reversal puts the low bits (the ones that select a bucket) first, so a
//! bucket's entries stay contiguous and doubling the table only inserts new
//! sentinels between existing entries instead of moving them.

use core::hash::{BuildHasher, Hash};

use foldhash::fast::FixedState;

/// Caller supplied table key.
pub type SoKey = u32;

/// Bit-reversed key used to order the shared list.
pub type ReverseKey = u32;

/// Most significant bit of a key, forced on for regular entries.
pub(crate) const KEY_MSB: SoKey = 1 << (SoKey::BITS - 1);

/// Reverses the bits of `key`.
#[inline(always)]
pub fn reverse_bits(key: SoKey) -> ReverseKey {
    key.reverse_bits()
}

/// Ordering key of a regular entry.
///
/// The top bit is forced on before reversal, so every regular key is odd and
/// sorts after the sentinel of the bucket it belongs to.
#[inline(always)]
pub fn regular_key(key: SoKey) -> ReverseKey {
    reverse_bits(key | KEY_MSB)
}

/// Ordering key of the sentinel for bucket `index`. Always even.
#[inline(always)]
pub fn sentinel_key(index: SoKey) -> ReverseKey {
    reverse_bits(index)
}

/// Clears the highest set bit of `index`.
///
/// This is the parent bucket: the bucket `index` was split from when the
/// table last doubled past it. Bucket 0 is its own parent.
#[inline(always)]
pub fn unset_msb(index: SoKey) -> SoKey {
    match index {
        0 => 0,
        _ => index & !(KEY_MSB >> index.leading_zeros()),
    }
}

/// Folds any hashable value into a table key.
///
/// Tables only ever see 32-bit keys; callers that key by paths, ids or
/// credentials derive them here. Distinct values may fold to the same key, so
/// tables fed by this function should be created with non-unique keys and a
/// matcher that compares the real value.
pub fn hash_key<T: Hash + ?Sized>(value: &T) -> SoKey {
    let hash = FixedState::default().hash_one(value);
    (hash ^ (hash >> 32)) as SoKey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_bits() {
        assert_eq!(reverse_bits(0), 0);
        assert_eq!(reverse_bits(1), 0x8000_0000);
        assert_eq!(reverse_bits(0x8000_0000), 1);
        assert_eq!(reverse_bits(0b110), 0x6000_0000);
    }

    #[test]
    fn test_regular_keys_are_odd_sentinels_even() {
        for k in [0u32, 1, 2, 7, 500, 0x7fff_ffff, u32::MAX] {
            assert_eq!(regular_key(k) & 1, 1);
        }
        for i in [0u32, 1, 2, 3, 1023, 0x7fff_ffff] {
            assert_eq!(sentinel_key(i) & 1, 0);
        }
    }

    #[test]
    fn test_sentinel_precedes_its_entries() {
        let size = 8;
        for key in 0..64u32 {
            let bucket = key % size;
            assert!(sentinel_key(bucket) < regular_key(key));
        }
    }

    #[test]
    fn test_unset_msb() {
        assert_eq!(unset_msb(0), 0);
        assert_eq!(unset_msb(1), 0);
        assert_eq!(unset_msb(2), 0);
        assert_eq!(unset_msb(3), 1);
        assert_eq!(unset_msb(6), 2);
        assert_eq!(unset_msb(7), 3);
        assert_eq!(unset_msb(12), 4);
        assert_eq!(unset_msb(u32::MAX), 0x7fff_ffff);
    }

    #[test]
    fn test_top_bit_collision() {
        // Keys differing only in the forced bit share an ordering key.
        assert_eq!(regular_key(5), regular_key(5 | KEY_MSB));
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("/vobs/src/main.c"), hash_key("/vobs/src/main.c"));
        assert_ne!(hash_key(&1u64), hash_key(&2u64));
    }
}
