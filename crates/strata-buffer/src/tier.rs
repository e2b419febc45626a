//! Slab sources - where each tier's memory comes from.
//!
//! A pool is tier-agnostic: it reserves pages, evicts, and tracks chunks
//! identically whether its slabs live on the host heap, in page-locked
//! host memory, or on an accelerator. The [`SlabSource`] given at
//! construction is the only thing that differs between tiers.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use strata_common::memory::{alloc_host_zeroed, free_host, SLAB_ALIGNMENT};
use strata_common::types::{DeviceId, MemorySpace, MgrKind};

use crate::error::{BufferError, BufferResult};
use crate::runtime::DeviceRuntime;

/// Allocator for a pool's slabs.
///
/// Slabs are large and long-lived: a pool allocates one at a time as it
/// fills, and frees them only on shutdown.
pub trait SlabSource: Send + Sync {
    /// Memory space the slabs live in.
    fn memory_space(&self) -> MemorySpace;

    /// Manager kind a pool over this source reports.
    fn mgr_kind(&self) -> MgrKind;

    /// Allocates one zero-initialized slab of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error when the tier's memory is exhausted; the pool
    /// turns this into an eviction-or-fail decision.
    fn alloc_slab(&self, bytes: usize) -> BufferResult<NonNull<u8>>;

    /// Frees a slab from [`alloc_slab`](Self::alloc_slab).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_slab` on this source with the same
    /// `bytes`, must not have been freed already, and no buffer may
    /// still reference memory inside it.
    unsafe fn free_slab(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Slabs from the ordinary host heap.
///
/// This is the CPU tier on a machine with no accelerator.
#[derive(Debug, Default)]
pub struct CpuHeapSource;

impl CpuHeapSource {
    /// Creates a host-heap source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SlabSource for CpuHeapSource {
    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Host
    }

    fn mgr_kind(&self) -> MgrKind {
        MgrKind::CpuMgr
    }

    fn alloc_slab(&self, bytes: usize) -> BufferResult<NonNull<u8>> {
        alloc_host_zeroed(bytes, SLAB_ALIGNMENT)
            .ok_or(BufferError::OutOfMemory { requested: bytes })
    }

    unsafe fn free_slab(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: contract forwarded from the caller
        unsafe { free_host(ptr, bytes, SLAB_ALIGNMENT) };
    }
}

/// Slabs of page-locked host memory from a device runtime.
///
/// This is the CPU tier on a machine with an accelerator: page-locked
/// slabs make host/device transfers DMA-able.
pub struct PinnedHostSource {
    runtime: Arc<dyn DeviceRuntime>,
}

impl PinnedHostSource {
    /// Creates a pinned-host source over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self { runtime }
    }
}

impl SlabSource for PinnedHostSource {
    fn memory_space(&self) -> MemorySpace {
        MemorySpace::PinnedHost
    }

    fn mgr_kind(&self) -> MgrKind {
        MgrKind::CpuMgr
    }

    fn alloc_slab(&self, bytes: usize) -> BufferResult<NonNull<u8>> {
        self.runtime.alloc_pinned_host(bytes)
    }

    unsafe fn free_slab(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: contract forwarded from the caller
        unsafe { self.runtime.free_pinned_host(ptr, bytes) };
    }
}

impl fmt::Debug for PinnedHostSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedHostSource").finish_non_exhaustive()
    }
}

/// Slabs on one accelerator device.
pub struct DeviceSource {
    runtime: Arc<dyn DeviceRuntime>,
    device: DeviceId,
}

impl DeviceSource {
    /// Creates a source allocating on `device` through `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn DeviceRuntime>, device: DeviceId) -> Self {
        Self { runtime, device }
    }

    /// Device this source allocates on.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl SlabSource for DeviceSource {
    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Device
    }

    fn mgr_kind(&self) -> MgrKind {
        MgrKind::GpuMgr
    }

    fn alloc_slab(&self, bytes: usize) -> BufferResult<NonNull<u8>> {
        self.runtime.alloc_device(bytes, self.device)
    }

    unsafe fn free_slab(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: contract forwarded from the caller
        unsafe { self.runtime.free_device(ptr, bytes, self.device) };
    }
}

impl fmt::Debug for DeviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSource")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostEmulatedRuntime;

    #[test]
    fn test_cpu_heap_slab_is_usable() {
        let source = CpuHeapSource::new();
        let slab = source.alloc_slab(8192).unwrap();
        assert_eq!(slab.as_ptr() as usize % SLAB_ALIGNMENT, 0);

        // SAFETY: 8192 fresh bytes, exclusively owned
        unsafe {
            slab.as_ptr().write(0x42);
            assert_eq!(slab.as_ptr().read(), 0x42);
            source.free_slab(slab, 8192);
        }
    }

    #[test]
    fn test_device_source_allocates_on_its_device() {
        let runtime = Arc::new(HostEmulatedRuntime::new());
        let source = DeviceSource::new(runtime.clone(), DeviceId::new(2));
        assert_eq!(source.memory_space(), MemorySpace::Device);
        assert_eq!(source.mgr_kind(), MgrKind::GpuMgr);

        let slab = source.alloc_slab(4096).unwrap();
        assert_eq!(runtime.device_bytes(), 4096);
        // SAFETY: allocated just above with the same size
        unsafe { source.free_slab(slab, 4096) };
        assert_eq!(runtime.device_bytes(), 0);
    }

    #[test]
    fn test_sources_as_trait_objects() {
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(HostEmulatedRuntime::new());
        let sources: Vec<Box<dyn SlabSource>> = vec![
            Box::new(CpuHeapSource::new()),
            Box::new(PinnedHostSource::new(runtime.clone())),
            Box::new(DeviceSource::new(runtime, DeviceId::new(0))),
        ];
        let spaces: Vec<_> = sources.iter().map(|s| s.memory_space()).collect();
        assert_eq!(
            spaces,
            [MemorySpace::Host, MemorySpace::PinnedHost, MemorySpace::Device]
        );
        for source in &sources {
            let slab = source.alloc_slab(1024).unwrap();
            // SAFETY: allocated just above with the same size
            unsafe { source.free_slab(slab, 1024) };
        }
    }
}
