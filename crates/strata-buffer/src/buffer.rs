//! Buffer core - the shared state behind every buffer handle.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;
use strata_common::types::{BufferId, ChunkKey, ChunkMetadata, DeviceId, MemorySpace};

use crate::segment::SegmentId;

/// Shared state of one buffer: identity, sizing, pin count, dirty flag,
/// and the raw base pointer into its slab.
///
/// The core is reference-counted: the segment table holds one reference
/// and every outstanding handle holds another. Metadata lives in atomics;
/// byte access and pinning go through the data latch, which is what makes
/// eviction safe against in-flight reads and in-flight pins (an evictor
/// must win the latch exclusively before retiring the memory, and it
/// re-checks the pin count once it has).
pub(crate) struct BufferCore {
    /// Pool-issued buffer ID.
    id: BufferId,
    /// Owning chunk key; `None` for scratch allocations.
    key: Option<ChunkKey>,
    /// Device the backing memory lives on.
    device: DeviceId,
    /// Memory space of the backing slab.
    space: MemorySpace,
    /// Logical page size the buffer was created with.
    page_size: usize,
    /// Logical size in bytes (how much the caller has written).
    size: AtomicUsize,
    /// Physical size in bytes (whole pages reserved in the slab).
    allocated: AtomicUsize,
    /// Base pointer into the slab; null while unsized or detached.
    mem: AtomicPtr<u8>,
    /// Segment currently backing this buffer.
    seg: AtomicU32,
    /// Pin count (number of active protections against eviction).
    pin_count: AtomicU32,
    /// Whether the buffer holds writes not yet checkpointed.
    dirty: AtomicBool,
    /// Set when the segment is deleted or evicted from under the buffer.
    detached: AtomicBool,
    /// Data latch: shared for reads, exclusive for writes and relocation.
    latch: RwLock<()>,
}

impl BufferCore {
    /// Creates a new core with no backing pages.
    pub fn new(
        id: BufferId,
        key: Option<ChunkKey>,
        device: DeviceId,
        space: MemorySpace,
        page_size: usize,
    ) -> Self {
        Self {
            id,
            key,
            device,
            space,
            page_size,
            size: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            mem: AtomicPtr::new(std::ptr::null_mut()),
            seg: AtomicU32::new(SegmentId::INVALID.as_u32()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            latch: RwLock::new(()),
        }
    }

    /// Returns the buffer ID.
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Returns the owning chunk key, if any.
    #[inline]
    pub fn key(&self) -> Option<&ChunkKey> {
        self.key.as_ref()
    }

    /// Returns the device the backing memory lives on.
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Returns the memory space of the backing slab.
    #[inline]
    pub fn space(&self) -> MemorySpace {
        self.space
    }

    /// Returns the logical page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the logical size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Sets the logical size in bytes.
    #[inline]
    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    /// Returns the physical (page-rounded) size in bytes.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Sets the physical size in bytes.
    #[inline]
    pub fn set_allocated(&self, bytes: usize) {
        self.allocated.store(bytes, Ordering::Release);
    }

    /// Returns the base pointer into the slab (null while unsized).
    #[inline]
    pub fn mem(&self) -> *mut u8 {
        self.mem.load(Ordering::Acquire)
    }

    /// Points the buffer at a new base address.
    #[inline]
    pub fn set_mem(&self, ptr: *mut u8) {
        self.mem.store(ptr, Ordering::Release);
    }

    /// Returns the backing segment's ID.
    #[inline]
    pub fn seg_id(&self) -> SegmentId {
        SegmentId::new(self.seg.load(Ordering::Acquire))
    }

    /// Points the buffer at a new backing segment.
    #[inline]
    pub fn set_seg(&self, seg: SegmentId) {
        self.seg.store(seg.as_u32(), Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    ///
    /// Takes the data latch shared so the increment is ordered against
    /// any in-progress eviction: a pin that returns before the evictor
    /// wins the latch is guaranteed to be seen by its re-check. Pinning
    /// an already-detached buffer does not resurrect it.
    #[inline]
    pub fn pin(&self) -> u32 {
        let _latch = self.latch.read();
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    ///
    /// # Panics
    ///
    /// Panics if the pin count is already 0. Unpinning past zero means
    /// some caller released a protection it never took, which voids the
    /// eviction-safety guarantee for everyone else.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "unpin on buffer with pin count 0");
        old - 1
    }

    /// Returns true if the buffer is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the buffer holds un-checkpointed writes.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets or clears the dirty flag.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if the segment behind this buffer is gone.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Takes a metadata snapshot of the buffer's current state.
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            size: self.size(),
            allocated: self.allocated(),
            page_size: self.page_size(),
            pin_count: self.pin_count(),
            dirty: self.is_dirty(),
        }
    }

    /// Severs the buffer from its memory.
    ///
    /// Callers must hold the data latch exclusively so no read or write
    /// is mid-copy when the pages are retired.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.mem.store(std::ptr::null_mut(), Ordering::Release);
        self.seg
            .store(SegmentId::INVALID.as_u32(), Ordering::Release);
        self.allocated.store(0, Ordering::Release);
    }

    /// Acquires the data latch for reading.
    #[inline]
    pub fn latch_read(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.latch.read()
    }

    /// Acquires the data latch for writing.
    #[inline]
    pub fn latch_write(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.latch.write()
    }
}

impl std::fmt::Debug for BufferCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCore")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("space", &self.space)
            .field("size", &self.size())
            .field("allocated", &self.allocated())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("detached", &self.is_detached())
            .finish()
    }
}
