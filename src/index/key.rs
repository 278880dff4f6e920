//! Canonical identity for small integer sets.

use std::hash::{Hash, Hasher};

/// Identity of an unordered set of small integers.
///
/// Two keys built from the same set of integers are equal regardless of the
/// order the integers were supplied in: the canonical representation is the
/// sorted buffer, and equality compares the buffer, never the hash. The hash
/// is precomputed with a 31-based multiplicative mix over the canonical
/// representation, so equal sets always hash alike.
///
/// A second constructor, [`IndexKey::pair`], forms an *ordered* pair key;
/// it is used to identify enum state values as `(enum-class-id, ordinal)`.
/// Pair keys and set keys are never mixed in one table.
#[derive(Debug, Clone, Eq)]
pub struct IndexKey {
    data: Box<[u32]>,
    hash: u32,
}

impl IndexKey {
    /// Build the key of a set, sorting the input into canonical order.
    pub fn of(mut values: Vec<u32>) -> Self {
        values.sort_unstable();
        Self::from_sorted(values)
    }

    /// Build the key of a set whose values are already sorted ascending.
    pub fn from_sorted(values: Vec<u32>) -> Self {
        debug_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        let data = values.into_boxed_slice();
        let hash = mix(&data);
        Self { data, hash }
    }

    /// Build an ordered pair key; `(a, b)` and `(b, a)` are distinct.
    pub fn pair(a: u32, b: u32) -> Self {
        let data: Box<[u32]> = Box::new([a, b]);
        let hash = mix(&data);
        Self { data, hash }
    }

    /// The canonical buffer.
    #[inline]
    pub fn values(&self) -> &[u32] {
        &self.data
    }

    /// Number of integers in the key.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the key is empty (the empty set is a valid composition key).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for IndexKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        // Equal data implies equal hash; the buffer is authoritative.
        self.data == other.data
    }
}

impl Hash for IndexKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// 31-based multiplicative mix with a final avalanche step.
fn mix(values: &[u32]) -> u32 {
    let mut h: u32 = 1;
    for &v in values {
        h = h.wrapping_mul(31).wrapping_add(v);
    }
    h ^= h >> 16;
    h
}
