//! Buffer handles - the public face of a pool-resident buffer.
//!
//! A [`Buffer`] borrows its pool, so handles cannot outlive the pool that
//! issued them; the borrow checker enforces what would otherwise be a
//! use-after-free of slab memory. Handles are cheap to clone (one `Arc`
//! bump) and all of their state queries are lock-free.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use strata_common::types::{BufferId, ChunkKey, ChunkMetadata, DeviceId, MemorySpace};

use crate::buffer::BufferCore;
use crate::error::{BufferError, BufferResult};
use crate::pool::BufferPool;

/// Handle to a buffer owned by a [`BufferPool`].
///
/// The handle does not keep the buffer resident: an unpinned buffer may
/// be evicted at any moment, after which byte access returns
/// [`BufferError::Detached`]. Call [`Buffer::pin`] (or take a
/// [`PinGuard`]) around any window where the bytes must stay in place.
///
/// Writers are expected to coordinate among themselves; concurrent
/// writes to one buffer are serialized by the data latch but their order
/// is unspecified.
#[derive(Clone)]
pub struct Buffer<'pool> {
    pool: &'pool BufferPool,
    core: Arc<BufferCore>,
}

impl<'pool> Buffer<'pool> {
    pub(crate) fn new(pool: &'pool BufferPool, core: Arc<BufferCore>) -> Self {
        Self { pool, core }
    }

    pub(crate) fn core(&self) -> &Arc<BufferCore> {
        &self.core
    }

    pub(crate) fn pool(&self) -> &'pool BufferPool {
        self.pool
    }

    /// Pool-issued buffer ID, unique within the pool's lifetime.
    #[inline]
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.core.id()
    }

    /// Chunk key this buffer serves, or `None` for scratch allocations.
    #[inline]
    #[must_use]
    pub fn key(&self) -> Option<&ChunkKey> {
        self.core.key()
    }

    /// Device the buffer's memory lives on.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.core.device()
    }

    /// Memory space the buffer's pages were allocated in.
    #[inline]
    #[must_use]
    pub fn memory_space(&self) -> MemorySpace {
        self.core.space()
    }

    /// Page size the buffer was created with.
    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.core.page_size()
    }

    /// Logical size in bytes (the bytes actually written).
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.core.size()
    }

    /// Reserved capacity in bytes; always a multiple of the page size
    /// and at least [`size`](Self::size).
    #[inline]
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.core.allocated()
    }

    /// Number of pages currently reserved.
    #[inline]
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.core.allocated() / self.core.page_size()
    }

    /// Pins the buffer, excluding it from eviction. Returns the new pin
    /// count. Every `pin` must be paired with an [`unpin`](Self::unpin).
    #[inline]
    pub fn pin(&self) -> u32 {
        self.core.pin()
    }

    /// Releases one pin. Returns the remaining pin count.
    ///
    /// # Panics
    ///
    /// Panics if the pin count is already zero; an unbalanced unpin is a
    /// caller bug, not a recoverable condition.
    #[inline]
    pub fn unpin(&self) -> u32 {
        self.core.unpin()
    }

    /// Current pin count.
    #[inline]
    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.core.pin_count()
    }

    /// Returns true if at least one pin is outstanding.
    #[inline]
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.core.is_pinned()
    }

    /// Pins the buffer for the guard's lifetime.
    #[must_use]
    pub fn pin_guard(&self) -> PinGuard<'_> {
        self.core.pin();
        PinGuard { core: &self.core }
    }

    /// Returns true if the buffer holds writes not yet checkpointed.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.core.is_dirty()
    }

    /// Returns true if the buffer's memory has been reclaimed (evicted,
    /// deleted, or the pool was cleared).
    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    /// Base address of the buffer's pages, or null when detached.
    ///
    /// The address is stable only while the buffer is pinned; for a
    /// device-space buffer it is a device address and must not be
    /// dereferenced on the host.
    #[inline]
    #[must_use]
    pub fn memory_ptr(&self) -> *const u8 {
        self.core.mem()
    }

    /// Takes a point-in-time metadata snapshot.
    #[must_use]
    pub fn metadata(&self) -> ChunkMetadata {
        self.core.metadata()
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::OutOfBounds`] if the range extends past the
    /// logical size, [`BufferError::Detached`] if the buffer's memory is
    /// gone, and [`BufferError::DeviceRuntime`] if a device copy fails.
    pub fn read(&self, dst: &mut [u8], offset: usize) -> BufferResult<()> {
        let _latch = self.core.latch_read();
        if self.core.is_detached() {
            return Err(BufferError::Detached);
        }
        let size = self.core.size();
        let end = offset
            .checked_add(dst.len())
            .filter(|&end| end <= size)
            .ok_or_else(|| BufferError::out_of_bounds(offset, dst.len(), size))?;
        if dst.is_empty() {
            return Ok(());
        }
        let src = self.core.mem().wrapping_add(offset);
        if self.core.space().is_host_accessible() {
            // SAFETY: the latch is held, the range was bounds-checked
            // against the logical size, and `dst` is a distinct borrow.
            unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        } else {
            let runtime = self.pool.runtime().ok_or_else(|| {
                BufferError::device_runtime("device buffer access without a runtime")
            })?;
            // SAFETY: src spans `dst.len()` device bytes within the
            // buffer's pages and the latch keeps them resident.
            unsafe { runtime.copy_device_to_host(dst.as_mut_ptr(), src, end - offset, self.core.device())? };
        }
        Ok(())
    }

    /// Copies `src` into the buffer at `offset`, growing the reservation
    /// and the logical size as needed and marking the buffer dirty.
    ///
    /// Writes must be contiguous with existing content: `offset` may not
    /// exceed the current logical size.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::OutOfBounds`] if `offset` is past the
    /// logical size, [`BufferError::OutOfMemory`] if growing the
    /// reservation fails, [`BufferError::Detached`] if the buffer's
    /// memory is gone, and [`BufferError::DeviceRuntime`] if a device
    /// copy fails.
    pub fn write(&self, src: &[u8], offset: usize) -> BufferResult<()> {
        let size = self.core.size();
        if offset > size {
            return Err(BufferError::out_of_bounds(offset, src.len(), size));
        }
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| BufferError::out_of_bounds(offset, src.len(), size))?;
        if src.is_empty() {
            return Ok(());
        }
        self.pool.ensure_capacity(&self.core, end)?;
        self.copy_in(src, offset)
    }

    /// Appends `src` at the current logical size.
    ///
    /// # Errors
    ///
    /// As for [`write`](Self::write), minus the contiguity case.
    pub fn append(&self, src: &[u8]) -> BufferResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        loop {
            let offset = self.core.size();
            let end = offset
                .checked_add(src.len())
                .ok_or_else(|| BufferError::out_of_bounds(offset, src.len(), offset))?;
            self.pool.ensure_capacity(&self.core, end)?;
            let _latch = self.core.latch_write();
            if self.core.is_detached() {
                return Err(BufferError::Detached);
            }
            // A concurrent append may land between the capacity check and
            // the latch; when it does, go ensure room for the new end.
            if self.core.size() != offset || end > self.core.allocated() {
                continue;
            }
            self.copy_bytes_in(src, offset)?;
            self.core.set_size(end);
            self.core.set_dirty(true);
            return Ok(());
        }
    }

    /// Grows the reservation to hold at least `num_bytes` without
    /// changing the logical size.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::OutOfMemory`] if the pool cannot find or
    /// evict enough pages, and [`BufferError::Detached`] if the buffer's
    /// memory is gone.
    pub fn reserve(&self, num_bytes: usize) -> BufferResult<()> {
        self.pool.ensure_capacity(&self.core, num_bytes)
    }

    fn copy_in(&self, src: &[u8], offset: usize) -> BufferResult<()> {
        let _latch = self.core.latch_write();
        if self.core.is_detached() {
            return Err(BufferError::Detached);
        }
        let end = offset + src.len();
        debug_assert!(end <= self.core.allocated());
        self.copy_bytes_in(src, offset)?;
        if end > self.core.size() {
            self.core.set_size(end);
        }
        self.core.set_dirty(true);
        Ok(())
    }

    /// Raw inbound copy. The caller holds the data latch exclusively and
    /// has verified the range fits the reservation.
    fn copy_bytes_in(&self, src: &[u8], offset: usize) -> BufferResult<()> {
        let dst = self.core.mem().wrapping_add(offset);
        if self.core.space().is_host_accessible() {
            // SAFETY: the latch is held exclusively and the range fits
            // the reservation.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        } else {
            let runtime = self.pool.runtime().ok_or_else(|| {
                BufferError::device_runtime("device buffer access without a runtime")
            })?;
            // SAFETY: dst spans `src.len()` device bytes within the
            // buffer's reservation and the latch is held exclusively.
            unsafe { runtime.copy_host_to_device(dst, src.as_ptr(), src.len(), self.core.device())? };
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.core.id())
            .field("key", &self.core.key())
            .field("size", &self.core.size())
            .field("allocated", &self.core.allocated())
            .field("pin_count", &self.core.pin_count())
            .field("dirty", &self.core.is_dirty())
            .field("detached", &self.core.is_detached())
            .finish()
    }
}

/// RAII pin: holds one pin on a buffer and releases it on drop.
#[must_use = "dropping the guard immediately unpins the buffer"]
pub struct PinGuard<'a> {
    core: &'a Arc<BufferCore>,
}

impl PinGuard<'_> {
    /// Pin count as of the last pin or unpin, including this guard.
    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.core.pin_count()
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.core.unpin();
    }
}

impl fmt::Debug for PinGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("buffer", &self.core.id())
            .field("pin_count", &self.core.pin_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BufferPoolConfig;
    use crate::pool::BufferPool;
    use strata_common::types::ChunkKey;

    fn small_pool() -> BufferPool {
        let config = BufferPoolConfig::new(64 * 1024).with_page_size(512);
        BufferPool::cpu(config).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let pool = small_pool();
        let key = ChunkKey::new(&[1, 2, 3]);
        let buf = pool.create_buffer(&key, 0, 0).unwrap();

        buf.write(b"hello buffer", 0).unwrap();
        assert_eq!(buf.size(), 12);
        assert!(buf.is_dirty());

        let mut out = [0u8; 12];
        buf.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"hello buffer");

        let mut tail = [0u8; 6];
        buf.read(&mut tail, 6).unwrap();
        assert_eq!(&tail, b"buffer");
    }

    #[test]
    fn test_write_must_be_contiguous() {
        let pool = small_pool();
        let key = ChunkKey::new(&[1]);
        let buf = pool.create_buffer(&key, 0, 0).unwrap();

        buf.write(b"abc", 0).unwrap();
        // Offset equal to size extends; past it is rejected.
        buf.write(b"def", 3).unwrap();
        assert_eq!(buf.size(), 6);
        assert!(buf.write(b"xyz", 7).is_err());
    }

    #[test]
    fn test_read_past_logical_size_fails() {
        let pool = small_pool();
        let key = ChunkKey::new(&[1]);
        let buf = pool.create_buffer(&key, 0, 100).unwrap();
        assert_eq!(buf.size(), 0);
        assert!(buf.allocated_size() >= 100);

        // Capacity alone is not readable; only written bytes are.
        let mut out = [0u8; 1];
        assert!(buf.read(&mut out, 0).is_err());
    }

    #[test]
    fn test_append_extends_size() {
        let pool = small_pool();
        let key = ChunkKey::new(&[2]);
        let buf = pool.create_buffer(&key, 0, 0).unwrap();

        buf.append(b"aaaa").unwrap();
        buf.append(b"bb").unwrap();
        assert_eq!(buf.size(), 6);

        let mut out = [0u8; 6];
        buf.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"aaaabb");
    }

    #[test]
    fn test_reserve_keeps_size_zero() {
        let pool = small_pool();
        let key = ChunkKey::new(&[3]);
        let buf = pool.create_buffer(&key, 0, 0).unwrap();

        buf.reserve(2048).unwrap();
        assert_eq!(buf.size(), 0);
        assert!(buf.allocated_size() >= 2048);
        assert_eq!(buf.allocated_size() % buf.page_size(), 0);
    }

    #[test]
    fn test_pin_guard_unpins_on_drop() {
        let pool = small_pool();
        let key = ChunkKey::new(&[4]);
        let buf = pool.create_buffer(&key, 0, 512).unwrap();

        assert_eq!(buf.pin_count(), 0);
        {
            let guard = buf.pin_guard();
            assert_eq!(guard.pin_count(), 1);
            assert!(buf.is_pinned());
        }
        assert_eq!(buf.pin_count(), 0);
    }

    #[test]
    fn test_write_grows_reservation() {
        let pool = small_pool();
        let key = ChunkKey::new(&[5]);
        let buf = pool.create_buffer(&key, 0, 512).unwrap();
        assert_eq!(buf.allocated_pages(), 1);

        let block = vec![7u8; 2000];
        buf.write(&block, 0).unwrap();
        assert_eq!(buf.size(), 2000);
        assert!(buf.allocated_size() >= 2000);

        let mut out = vec![0u8; 2000];
        buf.read(&mut out, 0).unwrap();
        assert_eq!(out, block);
    }
}
