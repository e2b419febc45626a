//! Chunk identity and metadata types.
//!
//! A chunk is one column's values for one table fragment. Within a single
//! manager a chunk is identified by a [`ChunkKey`], an ordered tuple of
//! integer coordinates.

use crate::constants::CHUNK_KEY_INLINE_LEN;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// The unique identity of a logical chunk within one manager.
///
/// A key is an ordered sequence of integers, commonly
/// `{db_id, table_id, fragment_id, column_id}` with optional sub-key
/// components appended. Keys compare lexicographically, which makes every
/// per-table or per-column operation a contiguous range scan over an
/// ordered index.
///
/// Keys are immutable values: created by the caller, never mutated by the
/// manager. Up to [`CHUNK_KEY_INLINE_LEN`] components are stored inline.
///
/// # Example
///
/// ```rust
/// use strata_common::types::ChunkKey;
///
/// let key = ChunkKey::new(&[1, 7, 0, 3]);
/// let prefix = ChunkKey::new(&[1, 7]);
/// assert!(key.starts_with(&prefix));
/// assert!(prefix < key);
/// ```
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey(SmallVec<[i32; CHUNK_KEY_INLINE_LEN]>);

impl ChunkKey {
    /// Creates a key from a slice of components.
    #[must_use]
    pub fn new(components: &[i32]) -> Self {
        Self(SmallVec::from_slice(components))
    }

    /// Creates a key from an owned vector of components.
    #[must_use]
    pub fn from_vec(components: Vec<i32>) -> Self {
        Self(SmallVec::from_vec(components))
    }

    /// Returns the number of components.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no components.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the components as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    /// Returns the component at `index`, if present.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<i32> {
        self.0.get(index).copied()
    }

    /// Returns true if this key begins with all of `prefix`'s components.
    ///
    /// The empty key is a prefix of every key.
    #[inline]
    #[must_use]
    pub fn starts_with(&self, prefix: &ChunkKey) -> bool {
        self.0.starts_with(prefix.as_slice())
    }

    /// Returns a new key with `component` appended.
    #[must_use]
    pub fn child(&self, component: i32) -> Self {
        let mut components = self.0.clone();
        components.push(component);
        Self(components)
    }

    /// Iterates over the components in order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({self})")
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{component}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<i32>> for ChunkKey {
    fn from(components: Vec<i32>) -> Self {
        Self::from_vec(components)
    }
}

impl From<&[i32]> for ChunkKey {
    fn from(components: &[i32]) -> Self {
        Self::new(components)
    }
}

impl<const N: usize> From<[i32; N]> for ChunkKey {
    fn from(components: [i32; N]) -> Self {
        Self::new(&components)
    }
}

impl FromIterator<i32> for ChunkKey {
    fn from_iter<T: IntoIterator<Item = i32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A read-only snapshot of one resident chunk's buffer state.
///
/// Returned by the metadata enumeration operations; the values reflect a
/// single moment and are not updated as the buffer changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Logical size in bytes (what the caller has written).
    pub size: usize,
    /// Physical size in bytes, rounded up to whole pages.
    pub allocated: usize,
    /// Page size the buffer was created with.
    pub page_size: usize,
    /// Pin count at snapshot time.
    pub pin_count: u32,
    /// Whether the buffer held un-checkpointed writes at snapshot time.
    pub dirty: bool,
}

impl ChunkMetadata {
    /// Number of whole pages backing the chunk.
    #[inline]
    #[must_use]
    pub const fn num_pages(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            self.allocated / self.page_size
        }
    }
}
