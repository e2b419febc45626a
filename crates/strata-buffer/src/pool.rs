//! The buffer pool - slab cache engine for one memory tier.
//!
//! One pool owns all slabs on one device and multiplexes them across
//! chunks:
//!
//! ```text
//!   ChunkKey --- chunk index ---> BufferCore <--- Buffer handles
//!                                     |
//!                               segment table
//!                                     |
//!            +------------------------+------------------------+
//!            v                        v                        v
//!      slab 0 [used|free|used]   slab 1 [free]     ...    slab N
//! ```
//!
//! Reservation walks a fixed ladder: first-fit over free segments, then
//! eviction of the coldest sufficient run of unpinned segments, then
//! growth by one slab, then out-of-memory. Lock order is chunk index,
//! then segment table, then a buffer's data latch; every code path
//! acquires in that order (or a suffix of it), which is what keeps
//! concurrent reservation, eviction, and byte access deadlock-free.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use strata_common::types::{BufferId, ChunkKey, ChunkMetadata, DeviceId, MemorySpace, MgrKind};

use crate::buffer::BufferCore;
use crate::config::BufferPoolConfig;
use crate::error::{BufferError, BufferResult};
use crate::handle::Buffer;
use crate::mgr::BufferMgr;
use crate::runtime::DeviceRuntime;
use crate::segment::{Segment, SegmentId, SegmentState};
use crate::slab::{SegmentTable, SlabId};
use crate::tier::{CpuHeapSource, DeviceSource, PinnedHostSource, SlabSource};

/// Buffer pool for one memory tier on one device.
///
/// See the [module docs](self) for the allocation ladder and lock order.
pub struct BufferPool {
    config: BufferPoolConfig,
    source: Box<dyn SlabSource>,
    runtime: Option<Arc<dyn DeviceRuntime>>,
    parent: Option<Arc<dyn BufferMgr>>,
    /// Key to core for every resident keyed chunk.
    chunk_index: Mutex<BTreeMap<ChunkKey, Arc<BufferCore>>>,
    /// Slabs plus the segment arena.
    table: Mutex<SegmentTable>,
    next_buffer_id: AtomicU64,
    /// Logical clock for LRU ordering; bumped on create, get, and grow.
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    creates: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    slab_allocs: AtomicU64,
    flushes: AtomicU64,
}

impl BufferPool {
    /// Creates a pool over an explicit slab source.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::Config`] if the configuration does not
    /// validate.
    pub fn new(config: BufferPoolConfig, source: Box<dyn SlabSource>) -> BufferResult<Self> {
        config.validate().map_err(BufferError::config)?;
        info!(
            kind = %source.mgr_kind(),
            device = %config.device_id,
            max_bytes = config.max_buffer_size,
            slab_bytes = config.slab_bytes(),
            page_size = config.page_size,
            "buffer pool created"
        );
        Ok(Self {
            config,
            source,
            runtime: None,
            parent: None,
            chunk_index: Mutex::new(BTreeMap::new()),
            table: Mutex::new(SegmentTable::new()),
            next_buffer_id: AtomicU64::new(BufferId::FIRST.as_u64()),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            slab_allocs: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// Creates a CPU-tier pool backed by the host heap.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::Config`] if the configuration does not
    /// validate.
    pub fn cpu(config: BufferPoolConfig) -> BufferResult<Self> {
        Self::new(config, Box::new(CpuHeapSource::new()))
    }

    /// Creates a CPU-tier pool backed by page-locked host memory from
    /// `runtime`.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::Config`] if the configuration does not
    /// validate.
    pub fn pinned_host(
        config: BufferPoolConfig,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> BufferResult<Self> {
        let source = Box::new(PinnedHostSource::new(runtime.clone()));
        Ok(Self::new(config, source)?.with_runtime(runtime))
    }

    /// Creates a device-tier pool allocating on `config.device_id`
    /// through `runtime`.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::Config`] if the configuration does not
    /// validate.
    pub fn device(config: BufferPoolConfig, runtime: Arc<dyn DeviceRuntime>) -> BufferResult<Self> {
        let source = Box::new(DeviceSource::new(runtime.clone(), config.device_id));
        Ok(Self::new(config, source)?.with_runtime(runtime))
    }

    /// Attaches a device runtime, used for cross-space byte movement.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Attaches the parent (colder) tier that `checkpoint` flushes into.
    #[must_use]
    pub fn with_parent(mut self, parent: Arc<dyn BufferMgr>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Memory space of the pool's slabs.
    #[must_use]
    pub fn memory_space(&self) -> MemorySpace {
        self.source.memory_space()
    }

    /// Kind of manager this pool reports.
    #[must_use]
    pub fn mgr_kind(&self) -> MgrKind {
        self.source.mgr_kind()
    }

    /// Device the pool's memory lives on.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    pub(crate) fn runtime(&self) -> Option<&Arc<dyn DeviceRuntime>> {
        self.runtime.as_ref()
    }

    /// Creates a buffer for `key`, reserving `initial_size` bytes.
    ///
    /// A `page_size` of zero selects the pool's page size. An
    /// `initial_size` of zero creates the buffer unsized; its first
    /// write materializes pages. The new buffer is not pinned: callers
    /// that need it stable across other allocations must pin it.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::DuplicateKey`] if `key` is resident and
    /// [`BufferError::OutOfMemory`] if the reservation cannot be
    /// satisfied. A failed create leaves the pool unchanged.
    pub fn create_buffer(
        &self,
        key: &ChunkKey,
        page_size: usize,
        initial_size: usize,
    ) -> BufferResult<Buffer<'_>> {
        let page_size = if page_size == 0 {
            self.config.page_size
        } else {
            page_size
        };
        let mut index = self.chunk_index.lock();
        if index.contains_key(key) {
            return Err(BufferError::duplicate_key(key));
        }
        let mut table = self.table.lock();
        let epoch = self.tick();
        let core = Arc::new(BufferCore::new(
            self.issue_id(),
            Some(key.clone()),
            self.config.device_id,
            self.source.memory_space(),
            page_size,
        ));
        if initial_size == 0 {
            let mut seg = Segment::unsized_placeholder(epoch);
            seg.key = Some(key.clone());
            seg.buffer = Some(core.clone());
            let seg_id = table.add_unsized(seg);
            core.set_seg(seg_id);
        } else {
            let num_pages = self.pages_for(initial_size, page_size)?;
            let seg_id = self.reserve_pages(&mut index, &mut table, num_pages)?;
            self.bind_segment(&mut table, seg_id, &core, epoch);
        }
        index.insert(key.clone(), core.clone());
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::new(self, core))
    }

    /// Returns the resident buffer for `key`, refreshing its LRU epoch.
    /// A nonzero `num_bytes` grows the reservation first.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::NotFound`] if `key` is not resident;
    /// this tier never fetches from a colder tier on its own.
    pub fn get_buffer(&self, key: &ChunkKey, num_bytes: usize) -> BufferResult<Buffer<'_>> {
        let Some(core) = self.chunk_index.lock().get(key).cloned() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::not_found(key));
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        let epoch = self.tick();
        {
            let mut table = self.table.lock();
            let seg_id = core.seg_id();
            if seg_id.is_valid() {
                table.seg_mut(seg_id).last_touched = epoch;
            }
        }
        if core.is_detached() {
            return Err(BufferError::not_found(key));
        }
        if num_bytes > 0 {
            self.ensure_capacity(&core, num_bytes)?;
        }
        Ok(Buffer::new(self, core))
    }

    /// Removes `key` and returns its pages to the free pool.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::NotFound`] if `key` is not resident.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is pinned.
    pub fn delete_buffer(&self, key: &ChunkKey) -> BufferResult<()> {
        let mut index = self.chunk_index.lock();
        let Some(core) = index.remove(key) else {
            return Err(BufferError::not_found(key));
        };
        assert!(
            !core.is_pinned(),
            "deleting pinned chunk {key} (pin count {})",
            core.pin_count()
        );
        let mut table = self.table.lock();
        self.release_core(&mut table, &core);
        Ok(())
    }

    /// Removes every resident chunk whose key starts with `prefix`;
    /// returns how many were removed. An empty prefix matches all.
    ///
    /// # Errors
    ///
    /// Infallible today; removing zero chunks is not an error.
    ///
    /// # Panics
    ///
    /// Panics if any matching buffer is pinned.
    pub fn delete_buffers_with_prefix(&self, prefix: &ChunkKey) -> BufferResult<usize> {
        let mut index = self.chunk_index.lock();
        let keys: Vec<ChunkKey> = index
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        let mut table = self.table.lock();
        for key in &keys {
            let core = index.remove(key).expect("key collected under this lock");
            assert!(
                !core.is_pinned(),
                "deleting pinned chunk {key} (pin count {})",
                core.pin_count()
            );
            self.release_core(&mut table, &core);
        }
        Ok(keys.len())
    }

    /// Copies `num_bytes` of `key`'s buffer into `dst`, which may belong
    /// to another pool in another memory space. Zero means "the whole
    /// logical size". `dst` is left not-dirty.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::NotFound`] if `key` is not resident and
    /// [`BufferError::OutOfBounds`] if `num_bytes` exceeds the source's
    /// logical size.
    pub fn fetch_buffer(
        &self,
        key: &ChunkKey,
        dst: &Buffer<'_>,
        num_bytes: usize,
    ) -> BufferResult<()> {
        let src = self.get_buffer(key, 0)?;
        let n = if num_bytes == 0 { src.size() } else { num_bytes };
        if n > src.size() {
            return Err(BufferError::out_of_bounds(0, n, src.size()));
        }
        // Stage through host memory so the two data latches are never
        // held at once; cross-pool latch nesting could deadlock.
        let mut staged = vec![0u8; n];
        src.read(&mut staged, 0)?;
        dst.write(&staged, 0)?;
        dst.core().set_dirty(false);
        Ok(())
    }

    /// Writes `num_bytes` from `src` into the resident buffer for `key`,
    /// creating it if absent. Zero means "all of `src`". The destination
    /// is left not-dirty: it now matches the source of truth.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::OutOfBounds`] if `num_bytes` exceeds
    /// `src`'s logical size and [`BufferError::OutOfMemory`] if the
    /// destination cannot be reserved.
    pub fn put_buffer(
        &self,
        key: &ChunkKey,
        src: &Buffer<'_>,
        num_bytes: usize,
    ) -> BufferResult<Buffer<'_>> {
        let n = if num_bytes == 0 { src.size() } else { num_bytes };
        if n > src.size() {
            return Err(BufferError::out_of_bounds(0, n, src.size()));
        }
        let mut staged = vec![0u8; n];
        src.read(&mut staged, 0)?;
        let dst = match self.get_buffer(key, 0) {
            Ok(buffer) => buffer,
            Err(BufferError::NotFound { .. }) => self.create_buffer(key, 0, n)?,
            Err(err) => return Err(err),
        };
        dst.write(&staged, 0)?;
        dst.core().set_dirty(false);
        Ok(dst)
    }

    /// Flushes every dirty resident chunk to the parent tier and clears
    /// its dirty flag. Without a parent this logs a warning and does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Propagates the first error from the parent's `put_buffer`;
    /// already-flushed chunks stay clean.
    pub fn checkpoint(&self) -> BufferResult<()> {
        self.checkpoint_filtered(None)
    }

    /// [`checkpoint`](Self::checkpoint) restricted to chunks whose key
    /// starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Propagates the first error from the parent's `put_buffer`.
    pub fn checkpoint_prefix(&self, prefix: &ChunkKey) -> BufferResult<()> {
        self.checkpoint_filtered(Some(prefix))
    }

    fn checkpoint_filtered(&self, prefix: Option<&ChunkKey>) -> BufferResult<()> {
        let Some(parent) = self.parent.as_ref() else {
            warn!(kind = %self.source.mgr_kind(), "checkpoint requested without a parent tier");
            return Ok(());
        };
        let dirty: Vec<(ChunkKey, Arc<BufferCore>)> = {
            let index = self.chunk_index.lock();
            index
                .iter()
                .filter(|(key, _)| prefix.is_none_or(|p| key.starts_with(p)))
                .filter(|(_, core)| core.is_dirty())
                .map(|(key, core)| (key.clone(), core.clone()))
                .collect()
        };
        let mut flushed = 0u64;
        for (key, core) in dirty {
            if core.is_detached() {
                continue;
            }
            let src = Buffer::new(self, core.clone());
            match parent.put_buffer(&key, &src, 0) {
                Ok(_) => {
                    core.set_dirty(false);
                    flushed += 1;
                }
                // Evicted between the snapshot and the flush.
                Err(BufferError::Detached) => {}
                Err(err) => return Err(err),
            }
        }
        self.flushes.fetch_add(flushed, Ordering::Relaxed);
        debug!(flushed, "checkpoint complete");
        Ok(())
    }

    /// Reserves a key-less scratch buffer with room for `num_bytes` (at
    /// least one page). The logical size starts at zero; reads cover
    /// only written bytes. Scratch buffers bypass the chunk index but
    /// are evictable like any other unpinned buffer; pin to hold.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::OutOfMemory`] if the reservation cannot
    /// be satisfied.
    pub fn alloc(&self, num_bytes: usize) -> BufferResult<Buffer<'_>> {
        let mut index = self.chunk_index.lock();
        let mut table = self.table.lock();
        let epoch = self.tick();
        let num_pages = self.pages_for(num_bytes, self.config.page_size)?;
        let seg_id = self.reserve_pages(&mut index, &mut table, num_pages)?;
        let core = Arc::new(BufferCore::new(
            self.issue_id(),
            None,
            self.config.device_id,
            self.source.memory_space(),
            self.config.page_size,
        ));
        self.bind_segment(&mut table, seg_id, &core, epoch);
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::new(self, core))
    }

    /// Returns a scratch buffer's pages to the free pool. Freeing an
    /// already-evicted scratch buffer is a no-op.
    ///
    /// # Errors
    ///
    /// Infallible today; fallible for parity with disk-backed managers.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is keyed (use
    /// [`delete_buffer`](Self::delete_buffer)) or pinned.
    pub fn free(&self, buffer: Buffer<'_>) -> BufferResult<()> {
        debug_assert!(ptr::eq(buffer.pool(), self));
        let core = buffer.core().clone();
        assert!(
            core.key().is_none(),
            "free on keyed buffer {:?}; use delete_buffer",
            core.key()
        );
        assert!(
            !core.is_pinned(),
            "freeing pinned scratch buffer {:?}",
            core.id()
        );
        let mut table = self.table.lock();
        if core.is_detached() {
            return Ok(());
        }
        self.release_core(&mut table, &core);
        Ok(())
    }

    /// Drops every buffer and resets all slabs to a single free segment
    /// each. Slab memory stays allocated for reuse. Outstanding handles
    /// observe their buffers as detached.
    ///
    /// # Panics
    ///
    /// Panics if any buffer is pinned.
    pub fn clear(&self) {
        let mut index = self.chunk_index.lock();
        let mut table = self.table.lock();
        let mut cores: Vec<Arc<BufferCore>> = Vec::new();
        for slab_id in table.slab_ids() {
            for &seg_id in table.slab(slab_id).segments() {
                if let Some(core) = &table.seg(seg_id).buffer {
                    cores.push(core.clone());
                }
            }
        }
        for &seg_id in table.unsized_segs() {
            if let Some(core) = &table.seg(seg_id).buffer {
                cores.push(core.clone());
            }
        }
        for core in &cores {
            assert!(
                !core.is_pinned(),
                "clearing pool with pinned buffer {:?}",
                core.id()
            );
        }
        for core in &cores {
            let _latch = core.latch_write();
            core.detach();
        }
        table.reset_segments();
        index.clear();
        self.epoch.store(0, Ordering::Release);
        info!(kind = %self.source.mgr_kind(), buffers = cores.len(), "pool cleared");
    }

    /// Returns true if `key` is resident in this pool.
    #[must_use]
    pub fn is_buffer_on_device(&self, key: &ChunkKey) -> bool {
        self.chunk_index.lock().contains_key(key)
    }

    /// Number of resident keyed chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.chunk_index.lock().len()
    }

    /// Bytes of slab memory currently allocated from the tier.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.lock().num_slabs() * self.config.slab_bytes()
    }

    /// Bytes of slab memory currently backing buffers.
    #[must_use]
    pub fn in_use_size(&self) -> usize {
        self.table.lock().in_use_pages() * self.config.page_size
    }

    /// Usable capacity in bytes once all slabs are allocated.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.config.max_num_pages() * self.config.page_size
    }

    /// Metadata snapshot for one resident chunk.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::NotFound`] if `key` is not resident.
    pub fn chunk_metadata(&self, key: &ChunkKey) -> BufferResult<ChunkMetadata> {
        self.chunk_index
            .lock()
            .get(key)
            .map(|core| core.metadata())
            .ok_or_else(|| BufferError::not_found(key))
    }

    /// Metadata snapshot of every resident chunk, in key order.
    #[must_use]
    pub fn chunk_metadata_vec(&self) -> Vec<(ChunkKey, ChunkMetadata)> {
        self.chunk_index
            .lock()
            .iter()
            .map(|(key, core)| (key.clone(), core.metadata()))
            .collect()
    }

    /// Metadata snapshot of resident chunks whose key starts with
    /// `prefix`, in key order.
    #[must_use]
    pub fn chunk_metadata_with_prefix(&self, prefix: &ChunkKey) -> Vec<(ChunkKey, ChunkMetadata)> {
        self.chunk_index
            .lock()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, core)| (key.clone(), core.metadata()))
            .collect()
    }

    /// Human-readable per-slab occupancy summary.
    #[must_use]
    pub fn dump_slabs(&self) -> String {
        let table = self.table.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} pool on device {}: {} of {} slabs, page size {}",
            self.source.mgr_kind(),
            self.config.device_id,
            table.num_slabs(),
            self.config.max_num_slabs(),
            self.config.page_size
        );
        for slab_id in table.slab_ids() {
            let slab = table.slab(slab_id);
            let (mut free, mut used, mut pinned) = (0usize, 0usize, 0usize);
            for &seg_id in slab.segments() {
                let seg = table.seg(seg_id);
                match seg.state {
                    SegmentState::Free => free += seg.num_pages,
                    SegmentState::Used => used += seg.num_pages,
                    SegmentState::Pinned => pinned += seg.num_pages,
                }
            }
            let _ = writeln!(
                out,
                "slab {}: {} pages ({used} used, {pinned} pinned, {free} free)",
                slab_id.index(),
                slab.num_pages()
            );
        }
        out
    }

    /// Human-readable listing of every segment.
    #[must_use]
    pub fn dump_segments(&self) -> String {
        let table = self.table.lock();
        let mut out = String::new();
        for slab_id in table.slab_ids() {
            let _ = writeln!(out, "slab {}:", slab_id.index());
            for &seg_id in table.slab(slab_id).segments() {
                let seg = table.seg(seg_id);
                let owner = match (&seg.key, &seg.buffer) {
                    (Some(key), _) => format!("key {key}"),
                    (None, Some(_)) => "scratch".to_string(),
                    (None, None) => String::new(),
                };
                let _ = writeln!(
                    out,
                    "  [{:>6}..{:>6}) {:<7} {:>5} pages  epoch {:>6}  {}",
                    seg.start_page,
                    seg.end_page(),
                    seg.state.to_string(),
                    seg.num_pages,
                    seg.last_touched,
                    owner
                );
            }
        }
        let unsized_count = table.unsized_segs().len();
        if unsized_count > 0 {
            let _ = writeln!(out, "unsized: {unsized_count} buffers awaiting first write");
        }
        out
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let (num_chunks, num_dirty, num_pinned) = {
            let index = self.chunk_index.lock();
            let dirty = index.values().filter(|core| core.is_dirty()).count();
            let pinned = index.values().filter(|core| core.is_pinned()).count();
            (index.len(), dirty, pinned)
        };
        let (num_slabs, in_use_pages) = {
            let table = self.table.lock();
            (table.num_slabs(), table.in_use_pages())
        };
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            slab_allocs: self.slab_allocs.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            num_chunks,
            num_dirty,
            num_pinned,
            allocated_bytes: num_slabs * self.config.slab_bytes(),
            in_use_bytes: in_use_pages * self.config.page_size,
        }
    }

    /// Grows `core`'s reservation to hold at least `num_bytes`.
    ///
    /// Growth always relocates: the old pages are shielded from the
    /// eviction scan, a larger range is reserved, live bytes are copied
    /// under the buffer's exclusive latch, and only then is the old
    /// range released. A failed growth leaves the buffer untouched.
    pub(crate) fn ensure_capacity(
        &self,
        core: &Arc<BufferCore>,
        num_bytes: usize,
    ) -> BufferResult<()> {
        if core.is_detached() {
            return Err(BufferError::Detached);
        }
        if core.allocated() >= num_bytes && core.allocated() > 0 {
            return Ok(());
        }
        let mut index = self.chunk_index.lock();
        let mut table = self.table.lock();
        if core.is_detached() {
            return Err(BufferError::Detached);
        }
        if core.allocated() >= num_bytes && core.allocated() > 0 {
            return Ok(());
        }
        let num_pages = self.pages_for(num_bytes, core.page_size())?;
        let old_seg = core.seg_id();
        debug_assert!(old_seg.is_valid());
        let epoch = self.tick();

        if table.seg(old_seg).is_unsized() {
            let new_seg = self.reserve_pages(&mut index, &mut table, num_pages)?;
            {
                let _latch = core.latch_write();
                self.bind_segment(&mut table, new_seg, core, epoch);
            }
            table.remove_unsized(old_seg);
            return Ok(());
        }

        let prev_state = table.seg(old_seg).state;
        table.seg_mut(old_seg).state = SegmentState::Pinned;
        let new_seg = match self.reserve_pages(&mut index, &mut table, num_pages) {
            Ok(seg) => seg,
            Err(err) => {
                table.seg_mut(old_seg).state = prev_state;
                return Err(err);
            }
        };
        let new_ptr = {
            let seg = table.seg(new_seg);
            let slab = seg.slab.expect("carved segment without a slab");
            table.slab(slab).page_ptr(seg.start_page, self.config.page_size)
        };
        let moved = {
            let _latch = core.latch_write();
            let logical = core.size();
            let result = if logical > 0 {
                self.copy_raw(core.mem(), new_ptr, logical)
            } else {
                Ok(())
            };
            if result.is_ok() {
                self.bind_segment(&mut table, new_seg, core, epoch);
            }
            result
        };
        match moved {
            Ok(()) => {
                table.release(old_seg);
                Ok(())
            }
            Err(err) => {
                table.release(new_seg);
                table.seg_mut(old_seg).state = prev_state;
                Err(err)
            }
        }
    }

    /// Reserves `num_pages` contiguous pages: first fit, then eviction
    /// of the coldest sufficient run, then growth by one slab. The
    /// carved segment comes back pinned; the caller binds a buffer and
    /// lowers it to used under the same table lock.
    fn reserve_pages(
        &self,
        index: &mut BTreeMap<ChunkKey, Arc<BufferCore>>,
        table: &mut SegmentTable,
        num_pages: usize,
    ) -> BufferResult<SegmentId> {
        debug_assert!(num_pages >= 1);
        let requested = num_pages.saturating_mul(self.config.page_size);
        if num_pages > self.config.pages_per_slab() {
            return Err(BufferError::out_of_memory(requested));
        }
        let epoch = self.epoch.load(Ordering::Acquire);

        loop {
            for slab_id in table.slab_ids().collect::<Vec<_>>() {
                let candidate = table
                    .slab(slab_id)
                    .segments()
                    .iter()
                    .copied()
                    .find(|&id| table.seg(id).is_free() && table.seg(id).num_pages >= num_pages);
                if let Some(free_seg) = candidate {
                    return Ok(table.carve(slab_id, free_seg, num_pages, epoch));
                }
            }

            let Some((slab_id, start_pos)) = self.find_eviction_run(table, num_pages) else {
                break;
            };
            match self.evict_run(index, table, slab_id, start_pos, num_pages) {
                Some(freed) => return Ok(table.carve(slab_id, freed, num_pages, epoch)),
                // A victim got pinned after the scan chose it. Whatever
                // the partial eviction freed is found by the next pass.
                None => continue,
            }
        }

        if table.num_slabs() < self.config.max_num_slabs() {
            let bytes = self.config.slab_bytes();
            match self.source.alloc_slab(bytes) {
                Ok(mem) => {
                    let slab_id = table.add_slab(mem, bytes, self.config.pages_per_slab());
                    self.slab_allocs.fetch_add(1, Ordering::Relaxed);
                    info!(slab = slab_id.index(), bytes, "allocated slab");
                    let span = table.slab(slab_id).segments()[0];
                    return Ok(table.carve(slab_id, span, num_pages, epoch));
                }
                Err(err) => {
                    warn!(%err, bytes, "slab allocation failed");
                }
            }
        }

        Err(BufferError::out_of_memory(requested))
    }

    /// Finds the contiguous run of free and evictable segments with the
    /// oldest score (max epoch of its used members) that covers
    /// `num_pages`. Returns the slab and the run's starting position in
    /// its segment list. Pinned segments and pinned buffers break runs.
    fn find_eviction_run(
        &self,
        table: &SegmentTable,
        num_pages: usize,
    ) -> Option<(SlabId, usize)> {
        let mut best: Option<(u64, SlabId, usize)> = None;
        for slab_id in table.slab_ids() {
            let segs = table.slab(slab_id).segments();
            for start_pos in 0..segs.len() {
                let mut pages = 0usize;
                let mut score = 0u64;
                for &seg_id in &segs[start_pos..] {
                    let seg = table.seg(seg_id);
                    let evictable = match seg.state {
                        SegmentState::Free => true,
                        SegmentState::Used => seg
                            .buffer
                            .as_ref()
                            .is_none_or(|buffer| buffer.pin_count() == 0),
                        SegmentState::Pinned => false,
                    };
                    if !evictable {
                        break;
                    }
                    pages += seg.num_pages;
                    if seg.state == SegmentState::Used {
                        score = score.max(seg.last_touched);
                    }
                    if pages >= num_pages {
                        if best.is_none_or(|(best_score, _, _)| score < best_score) {
                            best = Some((score, slab_id, start_pos));
                        }
                        break;
                    }
                }
            }
        }
        best.map(|(_, slab_id, start_pos)| (slab_id, start_pos))
    }

    /// Evicts the run chosen by [`find_eviction_run`]: detaches each
    /// victim buffer under its exclusive latch, removes its key from the
    /// chunk index, and releases its pages. Returns the merged free
    /// segment covering the run, or `None` if a victim was pinned after
    /// the scan chose it (pages evicted up to that point stay free).
    fn evict_run(
        &self,
        index: &mut BTreeMap<ChunkKey, Arc<BufferCore>>,
        table: &mut SegmentTable,
        slab_id: SlabId,
        start_pos: usize,
        num_pages: usize,
    ) -> Option<SegmentId> {
        // Snapshot the run's used members up front: releasing one can
        // coalesce away a free neighbor's id, so the free members must
        // never be touched again.
        let mut victims = Vec::new();
        {
            let segs = table.slab(slab_id).segments();
            let mut pages = 0usize;
            for &seg_id in &segs[start_pos..] {
                let seg = table.seg(seg_id);
                pages += seg.num_pages;
                if !seg.is_free() {
                    victims.push((
                        seg_id,
                        seg.buffer.clone().expect("used segment without a buffer"),
                        seg.key.clone(),
                        seg.num_pages,
                    ));
                }
                if pages >= num_pages {
                    break;
                }
            }
            debug_assert!(pages >= num_pages);
        }
        let mut freed = SegmentId::INVALID;
        for (seg_id, core, key, pages) in victims {
            {
                // The exclusive latch waits out in-flight reads and
                // blocks new pins; a pin that landed since the scan is
                // visible here and vetoes the whole run.
                let _latch = core.latch_write();
                if core.is_pinned() {
                    return None;
                }
                core.detach();
            }
            if let Some(key) = key.as_ref() {
                index.remove(key);
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = ?key, pages, "evicted");
            freed = table.release(seg_id);
        }
        if freed.is_valid() { Some(freed) } else { None }
    }

    /// Attaches `core` to a freshly carved segment and lowers the
    /// segment to the used state.
    fn bind_segment(
        &self,
        table: &mut SegmentTable,
        seg_id: SegmentId,
        core: &Arc<BufferCore>,
        epoch: u64,
    ) {
        {
            let seg = table.seg_mut(seg_id);
            seg.state = SegmentState::Used;
            seg.key = core.key().cloned();
            seg.buffer = Some(core.clone());
            seg.last_touched = epoch;
        }
        let seg = table.seg(seg_id);
        let slab = seg.slab.expect("binding to unsized segment");
        let ptr = table.slab(slab).page_ptr(seg.start_page, self.config.page_size);
        core.set_mem(ptr);
        core.set_seg(seg_id);
        core.set_allocated(seg.num_pages * self.config.page_size);
    }

    /// Detaches `core` under its latch and returns its segment's pages.
    fn release_core(&self, table: &mut SegmentTable, core: &Arc<BufferCore>) {
        let seg_id = core.seg_id();
        {
            let _latch = core.latch_write();
            core.detach();
        }
        if seg_id.is_valid() {
            if table.seg(seg_id).is_unsized() {
                table.remove_unsized(seg_id);
            } else {
                table.release(seg_id);
            }
        }
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Same-space copy between two ranges of this pool's slabs.
    fn copy_raw(&self, src: *const u8, dst: *mut u8, bytes: usize) -> BufferResult<()> {
        if self.source.memory_space().is_host_accessible() {
            // SAFETY: both ranges lie in this pool's slabs, span `bytes`,
            // and are disjoint page ranges.
            unsafe { ptr::copy_nonoverlapping(src, dst, bytes) };
            Ok(())
        } else {
            let runtime = self
                .runtime
                .as_ref()
                .ok_or_else(|| BufferError::device_runtime("device pool without a runtime"))?;
            let device = self.config.device_id;
            // SAFETY: both ranges lie in this pool's device slabs and
            // span `bytes`.
            unsafe { runtime.copy_device_to_device(dst, src, bytes, device, device) }
        }
    }

    /// Pool pages needed to round `num_bytes` up to whole buffer pages,
    /// with a floor of one buffer page for zero-byte requests.
    ///
    /// # Errors
    ///
    /// Fails with [`BufferError::OutOfMemory`] if the rounded byte count
    /// overflows `usize`.
    fn pages_for(&self, num_bytes: usize, buffer_page: usize) -> BufferResult<usize> {
        let rounded = num_bytes
            .div_ceil(buffer_page)
            .max(1)
            .checked_mul(buffer_page)
            .ok_or_else(|| BufferError::out_of_memory(num_bytes))?;
        Ok(rounded.div_ceil(self.config.page_size))
    }

    fn tick(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn issue_id(&self) -> BufferId {
        BufferId::new(self.next_buffer_id.fetch_add(1, Ordering::AcqRel))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        let source = &self.source;
        table.drain_slabs(|mem, bytes| {
            // SAFETY: each slab came from this source with this size; no
            // handle can outlive the pool, so nothing references it.
            unsafe { source.free_slab(mem, bytes) };
        });
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chunks = self.chunk_index.lock().len();
        let slabs = self.table.lock().num_slabs();
        f.debug_struct("BufferPool")
            .field("kind", &self.source.mgr_kind())
            .field("device", &self.config.device_id)
            .field("slabs", &slabs)
            .field("chunks", &chunks)
            .finish_non_exhaustive()
    }
}

impl BufferMgr for BufferPool {
    fn create_buffer(
        &self,
        key: &ChunkKey,
        page_size: usize,
        initial_size: usize,
    ) -> BufferResult<Buffer<'_>> {
        Self::create_buffer(self, key, page_size, initial_size)
    }

    fn get_buffer(&self, key: &ChunkKey, num_bytes: usize) -> BufferResult<Buffer<'_>> {
        Self::get_buffer(self, key, num_bytes)
    }

    fn delete_buffer(&self, key: &ChunkKey) -> BufferResult<()> {
        Self::delete_buffer(self, key)
    }

    fn delete_buffers_with_prefix(&self, prefix: &ChunkKey) -> BufferResult<usize> {
        Self::delete_buffers_with_prefix(self, prefix)
    }

    fn fetch_buffer(
        &self,
        key: &ChunkKey,
        dst: &Buffer<'_>,
        num_bytes: usize,
    ) -> BufferResult<()> {
        Self::fetch_buffer(self, key, dst, num_bytes)
    }

    fn put_buffer(
        &self,
        key: &ChunkKey,
        src: &Buffer<'_>,
        num_bytes: usize,
    ) -> BufferResult<Buffer<'_>> {
        Self::put_buffer(self, key, src, num_bytes)
    }

    fn checkpoint(&self) -> BufferResult<()> {
        Self::checkpoint(self)
    }

    fn checkpoint_prefix(&self, prefix: &ChunkKey) -> BufferResult<()> {
        Self::checkpoint_prefix(self, prefix)
    }

    fn alloc(&self, num_bytes: usize) -> BufferResult<Buffer<'_>> {
        Self::alloc(self, num_bytes)
    }

    fn free(&self, buffer: Buffer<'_>) -> BufferResult<()> {
        Self::free(self, buffer)
    }

    fn is_buffer_on_device(&self, key: &ChunkKey) -> bool {
        Self::is_buffer_on_device(self, key)
    }

    fn num_chunks(&self) -> usize {
        Self::num_chunks(self)
    }

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn in_use_size(&self) -> usize {
        Self::in_use_size(self)
    }

    fn max_size(&self) -> usize {
        Self::max_size(self)
    }

    fn mgr_kind(&self) -> MgrKind {
        Self::mgr_kind(self)
    }

    fn device_id(&self) -> DeviceId {
        Self::device_id(self)
    }

    fn chunk_metadata(&self, key: &ChunkKey) -> BufferResult<ChunkMetadata> {
        Self::chunk_metadata(self, key)
    }

    fn chunk_metadata_vec(&self) -> Vec<(ChunkKey, ChunkMetadata)> {
        Self::chunk_metadata_vec(self)
    }

    fn chunk_metadata_with_prefix(&self, prefix: &ChunkKey) -> Vec<(ChunkKey, ChunkMetadata)> {
        Self::chunk_metadata_with_prefix(self, prefix)
    }

    fn dump_slabs(&self) -> String {
        Self::dump_slabs(self)
    }

    fn dump_segments(&self) -> String {
        Self::dump_segments(self)
    }
}

/// Point-in-time snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    /// Chunk lookups that found a resident buffer.
    pub hits: u64,
    /// Chunk lookups that found nothing.
    pub misses: u64,
    /// Buffers created, keyed and scratch.
    pub creates: u64,
    /// Buffers deleted or freed.
    pub deletes: u64,
    /// Buffers evicted under memory pressure.
    pub evictions: u64,
    /// Slabs allocated from the tier.
    pub slab_allocs: u64,
    /// Dirty chunks flushed to the parent tier.
    pub flushes: u64,
    /// Resident keyed chunks right now.
    pub num_chunks: usize,
    /// Resident chunks holding un-checkpointed writes right now.
    pub num_dirty: usize,
    /// Resident chunks with at least one pin right now.
    pub num_pinned: usize,
    /// Slab bytes allocated right now.
    pub allocated_bytes: usize,
    /// Slab bytes backing buffers right now.
    pub in_use_bytes: usize,
}

impl BufferPoolStats {
    /// Fraction of lookups that hit, or zero before any lookup.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
