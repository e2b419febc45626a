//! Slab registry and segment table.
//!
//! A slab is one large contiguous allocation subdivided into pages; the
//! segment table tracks every slab's page ranges as an ordered list of
//! segments that always partitions the slab exactly. All mutation happens
//! under the pool's table lock; this module only enforces the partition
//! invariant, policy lives in the pool.

use std::ptr::NonNull;

use crate::segment::{Segment, SegmentId, SegmentState};

/// Stable identifier of a slab, in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlabId(u32);

impl SlabId {
    /// Creates a new slab ID.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One contiguous memory allocation subdivided into pages.
///
/// The base address is stable for the slab's lifetime: slabs are never
/// moved or resized, and are released only when the pool shuts down.
pub(crate) struct Slab {
    /// Base address of the allocation.
    mem: NonNull<u8>,
    /// Total bytes in the allocation.
    bytes: usize,
    /// Total pages.
    num_pages: usize,
    /// Segments ordered by start page; partitions `[0, num_pages)`.
    segments: Vec<SegmentId>,
}

// SAFETY: slab memory is owned by exactly one pool and all access to it is
// mediated by that pool's locks; device-space pointers are never
// dereferenced on the host.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Returns the base address.
    #[inline]
    pub fn mem(&self) -> NonNull<u8> {
        self.mem
    }

    /// Returns the total size in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns the total number of pages.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Returns the ordered segment list.
    #[inline]
    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }

    /// Returns the address of `page` given the pool's page size.
    ///
    /// For device-space slabs the result is a device address and must not
    /// be dereferenced on the host.
    #[inline]
    pub fn page_ptr(&self, page: usize, page_size: usize) -> *mut u8 {
        self.mem.as_ptr().wrapping_add(page * page_size)
    }
}

/// The pool's bookkeeping core: all slabs plus the segment arena.
///
/// Segments are stored in an arena and addressed by [`SegmentId`], so a
/// segment reference held by a buffer stays valid while *other* segments
/// split and merge around it.
pub(crate) struct SegmentTable {
    /// Slabs in allocation order.
    slabs: Vec<Slab>,
    /// Segment arena; `None` marks retired slots awaiting reuse.
    arena: Vec<Option<Segment>>,
    /// Retired arena slots ready for reuse.
    free_ids: Vec<SegmentId>,
    /// Unsized placeholder segments (buffers with no pages yet).
    unsized_segs: Vec<SegmentId>,
}

impl SegmentTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            arena: Vec::new(),
            free_ids: Vec::new(),
            unsized_segs: Vec::new(),
        }
    }

    /// Number of slabs allocated so far.
    #[inline]
    pub fn num_slabs(&self) -> usize {
        self.slabs.len()
    }

    /// IDs of all slabs, in allocation order.
    pub fn slab_ids(&self) -> impl Iterator<Item = SlabId> + '_ {
        (0..self.slabs.len())
            .map(|idx| SlabId::new(u32::try_from(idx).expect("slab count overflow")))
    }

    /// Returns the slab with the given ID.
    #[inline]
    pub fn slab(&self, id: SlabId) -> &Slab {
        &self.slabs[id.index()]
    }

    /// Returns the segment with the given ID.
    #[inline]
    pub fn seg(&self, id: SegmentId) -> &Segment {
        self.arena[id.index()]
            .as_ref()
            .expect("segment id refers to a retired slot")
    }

    /// Returns the segment with the given ID, mutably.
    #[inline]
    pub fn seg_mut(&mut self, id: SegmentId) -> &mut Segment {
        self.arena[id.index()]
            .as_mut()
            .expect("segment id refers to a retired slot")
    }

    /// IDs of the unsized placeholder segments.
    #[inline]
    pub fn unsized_segs(&self) -> &[SegmentId] {
        &self.unsized_segs
    }

    /// Registers a new slab and its initial spanning free segment.
    pub fn add_slab(&mut self, mem: NonNull<u8>, bytes: usize, num_pages: usize) -> SlabId {
        let slab_id = SlabId::new(u32::try_from(self.slabs.len()).expect("slab count overflow"));
        let span = self.insert(Segment::free(slab_id, 0, num_pages));
        self.slabs.push(Slab {
            mem,
            bytes,
            num_pages,
            segments: vec![span],
        });
        slab_id
    }

    /// Releases every slab's memory through `free`, consuming the table's
    /// slabs. Buffers must already be detached.
    pub fn drain_slabs(&mut self, mut free: impl FnMut(NonNull<u8>, usize)) {
        for slab in self.slabs.drain(..) {
            free(slab.mem, slab.bytes);
        }
        self.arena.clear();
        self.free_ids.clear();
        self.unsized_segs.clear();
    }

    /// Resets every slab to a single spanning free segment, keeping the
    /// slab memory allocated. Unsized placeholders are dropped.
    pub fn reset_segments(&mut self) {
        self.arena.clear();
        self.free_ids.clear();
        self.unsized_segs.clear();
        for idx in 0..self.slabs.len() {
            let slab_id = SlabId::new(u32::try_from(idx).expect("slab count overflow"));
            let num_pages = self.slabs[idx].num_pages;
            let span = self.insert(Segment::free(slab_id, 0, num_pages));
            self.slabs[idx].segments = vec![span];
        }
    }

    /// Adds an unsized placeholder segment.
    pub fn add_unsized(&mut self, seg: Segment) -> SegmentId {
        debug_assert!(seg.is_unsized());
        let id = self.insert(seg);
        self.unsized_segs.push(id);
        id
    }

    /// Removes an unsized placeholder segment.
    pub fn remove_unsized(&mut self, id: SegmentId) -> Segment {
        let pos = self
            .unsized_segs
            .iter()
            .position(|&s| s == id)
            .expect("segment is not on the unsized list");
        self.unsized_segs.swap_remove(pos);
        self.remove(id)
    }

    /// Carves `num_pages` from the front of a free segment.
    ///
    /// The carved segment comes back in the pinned state so it cannot be
    /// chosen by a concurrent eviction scan before its reservation
    /// completes; the caller lowers it to used once a buffer is attached.
    /// Returns the carved segment's ID (the original ID when the fit is
    /// exact).
    pub fn carve(
        &mut self,
        slab_id: SlabId,
        free_seg: SegmentId,
        num_pages: usize,
        epoch: u64,
    ) -> SegmentId {
        debug_assert!(self.seg(free_seg).is_free());
        debug_assert!(self.seg(free_seg).num_pages >= num_pages);

        if self.seg(free_seg).num_pages == num_pages {
            let seg = self.seg_mut(free_seg);
            seg.state = SegmentState::Pinned;
            seg.last_touched = epoch;
            return free_seg;
        }

        let start_page = self.seg(free_seg).start_page;
        {
            let remainder = self.seg_mut(free_seg);
            remainder.start_page += num_pages;
            remainder.num_pages -= num_pages;
        }

        let mut carved = Segment::free(slab_id, start_page, num_pages);
        carved.state = SegmentState::Pinned;
        carved.last_touched = epoch;
        let carved_id = self.insert(carved);

        let pos = self.position_in_slab(slab_id, free_seg);
        self.slabs[slab_id.index()].segments.insert(pos, carved_id);
        carved_id
    }

    /// Returns a sized segment's pages to the free state, coalescing with
    /// adjacent free neighbors. Returns the ID of the resulting free
    /// segment (which may differ from `seg_id` after a merge).
    pub fn release(&mut self, seg_id: SegmentId) -> SegmentId {
        let slab_id = self.seg(seg_id).slab.expect("release of unsized segment");
        {
            let seg = self.seg_mut(seg_id);
            seg.state = SegmentState::Free;
            seg.key = None;
            seg.buffer = None;
            seg.last_touched = 0;
        }

        let pos = self.position_in_slab(slab_id, seg_id);

        // Absorb a free right neighbor
        if let Some(&next_id) = self.slabs[slab_id.index()].segments.get(pos + 1) {
            if self.seg(next_id).is_free() {
                let absorbed = self.remove(next_id);
                self.slabs[slab_id.index()].segments.remove(pos + 1);
                self.seg_mut(seg_id).num_pages += absorbed.num_pages;
            }
        }

        // Merge into a free left neighbor
        if pos > 0 {
            let prev_id = self.slabs[slab_id.index()].segments[pos - 1];
            if self.seg(prev_id).is_free() {
                let absorbed = self.remove(seg_id);
                self.slabs[slab_id.index()].segments.remove(pos);
                self.seg_mut(prev_id).num_pages += absorbed.num_pages;
                return prev_id;
            }
        }

        seg_id
    }

    /// Total pages currently in used or pinned segments.
    pub fn in_use_pages(&self) -> usize {
        self.arena
            .iter()
            .flatten()
            .filter(|seg| !seg.is_free() && !seg.is_unsized())
            .map(|seg| seg.num_pages)
            .sum()
    }

    /// Checks the partition invariant: every slab's segment list covers
    /// `[0, num_pages)` in order with no gaps or overlaps.
    pub fn partition_ok(&self) -> bool {
        for slab in &self.slabs {
            let mut next_start = 0;
            for &seg_id in &slab.segments {
                let Some(seg) = self.arena.get(seg_id.index()).and_then(Option::as_ref) else {
                    return false;
                };
                if seg.start_page != next_start {
                    return false;
                }
                if seg.num_pages == 0 {
                    return false;
                }
                next_start = seg.end_page();
            }
            if next_start != slab.num_pages {
                return false;
            }
        }
        true
    }

    fn insert(&mut self, seg: Segment) -> SegmentId {
        if let Some(id) = self.free_ids.pop() {
            self.arena[id.index()] = Some(seg);
            id
        } else {
            let id = SegmentId::new(u32::try_from(self.arena.len()).expect("segment count overflow"));
            self.arena.push(Some(seg));
            id
        }
    }

    fn remove(&mut self, id: SegmentId) -> Segment {
        let seg = self.arena[id.index()]
            .take()
            .expect("segment id refers to a retired slot");
        self.free_ids.push(id);
        seg
    }

    fn position_in_slab(&self, slab_id: SlabId, seg_id: SegmentId) -> usize {
        self.slabs[slab_id.index()]
            .segments
            .iter()
            .position(|&s| s == seg_id)
            .expect("segment is not on its slab's list")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use strata_common::memory::{alloc_host_zeroed, free_host, SLAB_ALIGNMENT};

    const PAGE: usize = 512;

    /// Slab memory for tests, freed on drop (the table never frees).
    struct TestAlloc {
        ptr: NonNull<u8>,
        bytes: usize,
    }

    impl TestAlloc {
        fn new(bytes: usize) -> Self {
            let ptr = alloc_host_zeroed(bytes, SLAB_ALIGNMENT).unwrap();
            Self { ptr, bytes }
        }
    }

    impl Drop for TestAlloc {
        fn drop(&mut self) {
            // SAFETY: allocated in new() with the same size/alignment
            unsafe { free_host(self.ptr, self.bytes, SLAB_ALIGNMENT) };
        }
    }

    fn table_with_slab(num_pages: usize) -> (TestAlloc, SegmentTable, SlabId) {
        let mem = TestAlloc::new(num_pages * PAGE);
        let mut table = SegmentTable::new();
        let slab_id = table.add_slab(mem.ptr, num_pages * PAGE, num_pages);
        (mem, table, slab_id)
    }

    #[test]
    fn test_new_slab_is_one_free_segment() {
        let (_mem, table, slab_id) = table_with_slab(16);
        let slab = table.slab(slab_id);
        assert_eq!(slab.segments().len(), 1);
        let seg = table.seg(slab.segments()[0]);
        assert!(seg.is_free());
        assert_eq!(seg.start_page, 0);
        assert_eq!(seg.num_pages, 16);
        assert!(table.partition_ok());
    }

    #[test]
    fn test_carve_splits_free_segment() {
        let (_mem, mut table, slab_id) = table_with_slab(16);
        let span = table.slab(slab_id).segments()[0];

        let carved = table.carve(slab_id, span, 4, 1);
        assert_ne!(carved, span);
        assert_eq!(table.seg(carved).state, SegmentState::Pinned);
        assert_eq!(table.seg(carved).start_page, 0);
        assert_eq!(table.seg(carved).num_pages, 4);
        assert_eq!(table.seg(span).start_page, 4);
        assert_eq!(table.seg(span).num_pages, 12);
        assert_eq!(table.slab(slab_id).segments(), &[carved, span]);
        assert!(table.partition_ok());
    }

    #[test]
    fn test_carve_exact_fit_reuses_segment() {
        let (_mem, mut table, slab_id) = table_with_slab(8);
        let span = table.slab(slab_id).segments()[0];

        let carved = table.carve(slab_id, span, 8, 1);
        assert_eq!(carved, span);
        assert_eq!(table.seg(carved).state, SegmentState::Pinned);
        assert_eq!(table.slab(slab_id).segments().len(), 1);
        assert!(table.partition_ok());
    }

    #[test]
    fn test_release_coalesces_both_neighbors() {
        let (_mem, mut table, slab_id) = table_with_slab(12);
        let span = table.slab(slab_id).segments()[0];

        let a = table.carve(slab_id, span, 4, 1);
        let b = table.carve(slab_id, span, 4, 2);
        assert_eq!(table.slab(slab_id).segments(), &[a, b, span]);

        // Free the head, then the middle: the middle absorbs the free tail
        // and merges into the head, leaving one spanning free segment.
        table.release(a);
        let merged = table.release(b);
        assert_eq!(table.slab(slab_id).segments().len(), 1);
        assert_eq!(table.seg(merged).num_pages, 12);
        assert!(table.seg(merged).is_free());
        assert!(table.partition_ok());
    }

    #[test]
    fn test_release_keeps_used_neighbors_intact() {
        let (_mem, mut table, slab_id) = table_with_slab(12);
        let span = table.slab(slab_id).segments()[0];

        let a = table.carve(slab_id, span, 4, 1);
        let b = table.carve(slab_id, span, 4, 2);
        table.seg_mut(a).state = SegmentState::Used;
        table.seg_mut(b).state = SegmentState::Used;

        let freed = table.release(a);
        assert_eq!(freed, a);
        assert_eq!(table.slab(slab_id).segments().len(), 3);
        assert!(table.seg(a).is_free());
        assert_eq!(table.seg(b).state, SegmentState::Used);
        assert!(table.partition_ok());
    }

    #[test]
    fn test_unsized_add_remove() {
        let mut table = SegmentTable::new();
        let id = table.add_unsized(Segment::unsized_placeholder(3));
        assert_eq!(table.unsized_segs(), &[id]);
        assert!(table.seg(id).is_unsized());

        let seg = table.remove_unsized(id);
        assert_eq!(seg.last_touched, 3);
        assert!(table.unsized_segs().is_empty());
    }

    #[test]
    fn test_reset_segments_keeps_slabs() {
        let (_mem, mut table, slab_id) = table_with_slab(8);
        let span = table.slab(slab_id).segments()[0];
        let carved = table.carve(slab_id, span, 2, 1);
        table.seg_mut(carved).state = SegmentState::Used;

        table.reset_segments();

        assert_eq!(table.num_slabs(), 1);
        assert_eq!(table.slab(slab_id).segments().len(), 1);
        let seg = table.seg(table.slab(slab_id).segments()[0]);
        assert!(seg.is_free());
        assert_eq!(seg.num_pages, 8);
        assert!(table.partition_ok());
    }

    #[test]
    fn test_partition_invariant_random_storm() {
        let (_mem, mut table, slab_id) = table_with_slab(64);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut held: Vec<SegmentId> = Vec::new();

        for _ in 0..500 {
            if rng.gen_bool(0.6) {
                // Reserve: first-fit over the slab's free segments
                let want = rng.gen_range(1..=8);
                let candidate = table
                    .slab(slab_id)
                    .segments()
                    .iter()
                    .copied()
                    .find(|&id| table.seg(id).is_free() && table.seg(id).num_pages >= want);
                if let Some(free_seg) = candidate {
                    let carved = table.carve(slab_id, free_seg, want, 1);
                    table.seg_mut(carved).state = SegmentState::Used;
                    held.push(carved);
                }
            } else if !held.is_empty() {
                let idx = rng.gen_range(0..held.len());
                let id = held.swap_remove(idx);
                table.release(id);
            }
            assert!(table.partition_ok());
        }
    }
}
