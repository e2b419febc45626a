//! The tier-manager contract.
//!
//! Memory tiers form a chain: a device pool flushes into a CPU pool, the
//! CPU pool into a disk-backed manager implemented outside this crate.
//! [`BufferMgr`] is the narrow, object-safe interface every level speaks
//! so that a pool can hold its parent as `Arc<dyn BufferMgr>` without
//! knowing what stands behind it. Parent chains must be acyclic; a cycle
//! would deadlock the first checkpoint.

use strata_common::types::{ChunkKey, ChunkMetadata, DeviceId, MgrKind};

use crate::error::BufferResult;
use crate::handle::Buffer;

/// One memory tier's buffer manager.
///
/// Handles returned by the read-style operations borrow the manager, so
/// a caller going through `Arc<dyn BufferMgr>` keeps the `Arc` alive for
/// as long as it holds any handle.
pub trait BufferMgr: Send + Sync {
    /// Creates a buffer for `key`, reserving `initial_size` bytes.
    ///
    /// A `page_size` of zero selects the manager's own page size; an
    /// `initial_size` of zero creates the buffer unsized, to be
    /// materialized by its first write.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateKey` if `key` is already resident and
    /// `OutOfMemory` if the reservation cannot be satisfied.
    fn create_buffer(
        &self,
        key: &ChunkKey,
        page_size: usize,
        initial_size: usize,
    ) -> BufferResult<Buffer<'_>>;

    /// Returns the resident buffer for `key`, growing its reservation to
    /// at least `num_bytes` first when `num_bytes` is nonzero.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if `key` is not resident; this tier never
    /// fetches from a colder tier on its own.
    fn get_buffer(&self, key: &ChunkKey, num_bytes: usize) -> BufferResult<Buffer<'_>>;

    /// Removes `key` and returns its pages to the free pool.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if `key` is not resident.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is pinned; deleting pinned data is a caller
    /// protocol violation.
    fn delete_buffer(&self, key: &ChunkKey) -> BufferResult<()>;

    /// Removes every resident chunk whose key starts with `prefix` and
    /// returns how many were removed.
    ///
    /// # Errors
    ///
    /// Currently infallible for missing prefixes (removing zero chunks
    /// is not an error).
    ///
    /// # Panics
    ///
    /// Panics if any matching buffer is pinned.
    fn delete_buffers_with_prefix(&self, prefix: &ChunkKey) -> BufferResult<usize>;

    /// Copies `num_bytes` of `key`'s resident buffer into `dst`, which
    /// may live in another pool and another memory space. Zero means
    /// "the whole logical size". `dst` is left not-dirty.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if `key` is not resident and `OutOfBounds`
    /// if `num_bytes` exceeds the source's logical size.
    fn fetch_buffer(&self, key: &ChunkKey, dst: &Buffer<'_>, num_bytes: usize)
        -> BufferResult<()>;

    /// Writes `num_bytes` from `src` into the resident buffer for `key`,
    /// creating it if absent. Zero means "all of `src`". The destination
    /// is left not-dirty: its content now matches the source of truth.
    ///
    /// # Errors
    ///
    /// Fails with `OutOfBounds` if `num_bytes` exceeds `src`'s logical
    /// size and `OutOfMemory` if the destination cannot be reserved.
    fn put_buffer(
        &self,
        key: &ChunkKey,
        src: &Buffer<'_>,
        num_bytes: usize,
    ) -> BufferResult<Buffer<'_>>;

    /// Flushes every dirty resident chunk to the parent tier and clears
    /// its dirty flag. Without a parent this logs and does nothing.
    ///
    /// # Errors
    ///
    /// Propagates the first error from the parent's `put_buffer`.
    fn checkpoint(&self) -> BufferResult<()>;

    /// [`checkpoint`](Self::checkpoint) restricted to chunks whose key
    /// starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Propagates the first error from the parent's `put_buffer`.
    fn checkpoint_prefix(&self, prefix: &ChunkKey) -> BufferResult<()>;

    /// Reserves a key-less scratch buffer with room for `num_bytes`.
    /// The logical size starts at zero and grows with writes. Scratch
    /// buffers bypass the chunk index and are subject to eviction like
    /// any other unpinned buffer; pin to hold.
    ///
    /// # Errors
    ///
    /// Fails with `OutOfMemory` if the reservation cannot be satisfied.
    fn alloc(&self, num_bytes: usize) -> BufferResult<Buffer<'_>>;

    /// Returns a scratch buffer's pages to the free pool.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for disk-backed implementations.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is keyed (use
    /// [`delete_buffer`](Self::delete_buffer)) or pinned.
    fn free(&self, buffer: Buffer<'_>) -> BufferResult<()>;

    /// Returns true if `key` is resident in this tier.
    fn is_buffer_on_device(&self, key: &ChunkKey) -> bool;

    /// Number of resident keyed chunks.
    fn num_chunks(&self) -> usize;

    /// Bytes of slab memory currently allocated from the tier.
    fn size(&self) -> usize;

    /// Bytes of slab memory currently backing buffers.
    fn in_use_size(&self) -> usize;

    /// Usable capacity in bytes once all slabs are allocated.
    fn max_size(&self) -> usize;

    /// Kind of manager (cpu, gpu, file).
    fn mgr_kind(&self) -> MgrKind;

    /// Device this manager's memory lives on.
    fn device_id(&self) -> DeviceId;

    /// Metadata snapshot for one resident chunk.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if `key` is not resident.
    fn chunk_metadata(&self, key: &ChunkKey) -> BufferResult<ChunkMetadata>;

    /// Metadata snapshot of every resident chunk, in key order.
    fn chunk_metadata_vec(&self) -> Vec<(ChunkKey, ChunkMetadata)>;

    /// Metadata snapshot of resident chunks whose key starts with
    /// `prefix`, in key order.
    fn chunk_metadata_with_prefix(&self, prefix: &ChunkKey) -> Vec<(ChunkKey, ChunkMetadata)>;

    /// Human-readable per-slab occupancy summary. Diagnostics only.
    fn dump_slabs(&self) -> String;

    /// Human-readable listing of every segment. Diagnostics only.
    fn dump_segments(&self) -> String;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::BufferPoolConfig;
    use crate::pool::BufferPool;

    fn dyn_pool() -> Arc<dyn BufferMgr> {
        let config = BufferPoolConfig::new(64 * 1024).with_page_size(512);
        Arc::new(BufferPool::cpu(config).unwrap())
    }

    #[test]
    fn test_pool_usable_through_trait_object() {
        let mgr = dyn_pool();
        let key = ChunkKey::new(&[1, 2, 3, 4]);

        let buf = mgr.create_buffer(&key, 0, 0).unwrap();
        buf.write(b"through the trait", 0).unwrap();
        drop(buf);

        assert!(mgr.is_buffer_on_device(&key));
        assert_eq!(mgr.num_chunks(), 1);
        assert_eq!(mgr.mgr_kind(), MgrKind::CpuMgr);

        let buf = mgr.get_buffer(&key, 0).unwrap();
        let mut out = [0u8; 17];
        buf.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"through the trait");
        drop(buf);

        mgr.delete_buffer(&key).unwrap();
        assert_eq!(mgr.num_chunks(), 0);
    }

    #[test]
    fn test_metadata_through_trait_object() {
        let mgr = dyn_pool();
        let key = ChunkKey::new(&[7, 1]);
        let buf = mgr.create_buffer(&key, 0, 600).unwrap();
        buf.write(b"x", 0).unwrap();
        drop(buf);

        let meta = mgr.chunk_metadata(&key).unwrap();
        assert_eq!(meta.size, 1);
        assert_eq!(meta.allocated, 1024);
        assert!(meta.dirty);

        let all = mgr.chunk_metadata_vec();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, key);
    }
}
