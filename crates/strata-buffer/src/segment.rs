//! Segment bookkeeping records.
//!
//! A segment describes one contiguous page range inside a slab: free,
//! used by a chunk, or pinned. Segments are stored in an arena indexed by
//! [`SegmentId`] so references stay valid across list surgery during
//! allocation and eviction.

use std::fmt;
use std::sync::Arc;

use strata_common::types::ChunkKey;

use crate::buffer::BufferCore;
use crate::slab::SlabId;

/// Stable index of a segment in the pool's segment arena.
///
/// Unlike a position in a slab's segment list, a `SegmentId` survives
/// splits and merges of *other* segments; it is only retired when its own
/// segment is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SegmentId(u32);

impl SegmentId {
    /// Invalid segment ID, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new segment ID.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid segment ID.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

/// State of a segment's page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentState {
    /// Pages are unowned and available for reservation.
    Free,
    /// Pages back a chunk's buffer; evictable while the buffer is unpinned.
    Used,
    /// Pages are mid-reservation and must not be considered for eviction,
    /// whatever the buffer's pin count currently reads.
    Pinned,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Used => "used",
            Self::Pinned => "pinned",
        };
        f.write_str(name)
    }
}

/// One contiguous page range inside a slab, or an unsized placeholder.
///
/// Sized segments (`slab` is `Some`) partition their slab exactly; the
/// table enforces no gaps and no overlaps. Unsized segments (`slab` is
/// `None`) hold zero pages and stand in for buffers created with no
/// initial allocation.
pub(crate) struct Segment {
    /// First page of the range within the slab.
    pub start_page: usize,
    /// Number of pages in the range.
    pub num_pages: usize,
    /// Allocation state.
    pub state: SegmentState,
    /// Owning slab, or `None` for an unsized placeholder.
    pub slab: Option<SlabId>,
    /// Owning chunk key, if this segment backs a keyed chunk.
    pub key: Option<ChunkKey>,
    /// The buffer carved over this range, if any.
    pub buffer: Option<Arc<BufferCore>>,
    /// Epoch of the last touch, for LRU-ordered eviction.
    pub last_touched: u64,
}

impl Segment {
    /// Creates a free segment covering `[start_page, start_page + num_pages)`.
    pub fn free(slab: SlabId, start_page: usize, num_pages: usize) -> Self {
        Self {
            start_page,
            num_pages,
            state: SegmentState::Free,
            slab: Some(slab),
            key: None,
            buffer: None,
            last_touched: 0,
        }
    }

    /// Creates an unsized placeholder holding no pages.
    pub fn unsized_placeholder(epoch: u64) -> Self {
        Self {
            start_page: 0,
            num_pages: 0,
            state: SegmentState::Used,
            slab: None,
            key: None,
            buffer: None,
            last_touched: epoch,
        }
    }

    /// First page past the end of the range.
    #[inline]
    pub fn end_page(&self) -> usize {
        self.start_page + self.num_pages
    }

    /// Returns true if the segment's pages are unowned.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SegmentState::Free
    }

    /// Returns true if this is an unsized placeholder.
    #[inline]
    pub fn is_unsized(&self) -> bool {
        self.slab.is_none()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("start_page", &self.start_page)
            .field("num_pages", &self.num_pages)
            .field("state", &self.state)
            .field("slab", &self.slab)
            .field("key", &self.key)
            .field("last_touched", &self.last_touched)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id() {
        assert!(!SegmentId::INVALID.is_valid());
        assert!(SegmentId::new(0).is_valid());
        assert_eq!(SegmentId::new(42).index(), 42);
    }

    #[test]
    fn test_free_segment() {
        let seg = Segment::free(SlabId::new(0), 4, 12);
        assert!(seg.is_free());
        assert!(!seg.is_unsized());
        assert_eq!(seg.end_page(), 16);
        assert!(seg.key.is_none());
    }

    #[test]
    fn test_unsized_placeholder() {
        let seg = Segment::unsized_placeholder(7);
        assert!(seg.is_unsized());
        assert_eq!(seg.num_pages, 0);
        assert_eq!(seg.state, SegmentState::Used);
        assert_eq!(seg.last_touched, 7);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SegmentState::Free.to_string(), "free");
        assert_eq!(SegmentState::Used.to_string(), "used");
        assert_eq!(SegmentState::Pinned.to_string(), "pinned");
    }
}
