//! Device runtime abstraction.
//!
//! Pools that manage pinned-host or device memory delegate allocation
//! and cross-space copies to a [`DeviceRuntime`]. The trait is the seam
//! where a CUDA (or HIP, or Metal) binding plugs in; the crate itself
//! ships only [`HostEmulatedRuntime`], which backs "device" memory with
//! ordinary host allocations so every tier can run and be tested on a
//! machine with no accelerator.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use strata_common::memory::{alloc_host_zeroed, free_host, CACHE_LINE_SIZE};
use strata_common::types::DeviceId;

use crate::error::{BufferError, BufferResult};

/// Allocation and copy primitives for one accelerator backend.
///
/// Implementations must be safe to call from multiple threads; the pool
/// does not serialize runtime calls.
pub trait DeviceRuntime: Send + Sync {
    /// Allocates `bytes` of page-locked host memory, zero-initialized.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot satisfy the allocation.
    fn alloc_pinned_host(&self, bytes: usize) -> BufferResult<NonNull<u8>>;

    /// Frees memory from [`alloc_pinned_host`](Self::alloc_pinned_host).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_pinned_host` on this runtime with the
    /// same `bytes`, must not have been freed already, and must have no
    /// outstanding references.
    unsafe fn free_pinned_host(&self, ptr: NonNull<u8>, bytes: usize);

    /// Allocates `bytes` of memory on `device`, zero-initialized.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot satisfy the allocation.
    fn alloc_device(&self, bytes: usize, device: DeviceId) -> BufferResult<NonNull<u8>>;

    /// Frees memory from [`alloc_device`](Self::alloc_device).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_device` on this runtime with the same
    /// `bytes` and `device`, must not have been freed already, and must
    /// have no outstanding references.
    unsafe fn free_device(&self, ptr: NonNull<u8>, bytes: usize, device: DeviceId);

    /// Copies `bytes` from host memory to `device` memory.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes` on the host and `dst` writable
    /// for `bytes` on `device`; the ranges must not overlap.
    unsafe fn copy_host_to_device(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        device: DeviceId,
    ) -> BufferResult<()>;

    /// Copies `bytes` from `device` memory to host memory.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes` on `device` and `dst` writable
    /// for `bytes` on the host; the ranges must not overlap.
    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        device: DeviceId,
    ) -> BufferResult<()>;

    /// Copies `bytes` between device allocations, possibly across
    /// devices.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes` on `src_device` and `dst`
    /// writable for `bytes` on `dst_device`; the ranges must not
    /// overlap.
    unsafe fn copy_device_to_device(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        dst_device: DeviceId,
        src_device: DeviceId,
    ) -> BufferResult<()>;
}

/// Runtime that emulates an accelerator with plain host memory.
///
/// Pinned-host and device allocations both come from the host heap and
/// copies are `memcpy`s, so pinned and device tiers behave identically
/// to the CPU tier while keeping their wiring exercised. Counters track
/// outstanding bytes per space for leak checks in tests.
#[derive(Debug, Default)]
pub struct HostEmulatedRuntime {
    pinned_bytes: AtomicUsize,
    device_bytes: AtomicUsize,
    copies: AtomicUsize,
}

impl HostEmulatedRuntime {
    /// Creates a runtime with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding pinned-host bytes.
    #[must_use]
    pub fn pinned_bytes(&self) -> usize {
        self.pinned_bytes.load(Ordering::Acquire)
    }

    /// Outstanding emulated-device bytes.
    #[must_use]
    pub fn device_bytes(&self) -> usize {
        self.device_bytes.load(Ordering::Acquire)
    }

    /// Number of copies performed, across all directions.
    #[must_use]
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::Acquire)
    }

    fn alloc(&self, bytes: usize) -> BufferResult<NonNull<u8>> {
        alloc_host_zeroed(bytes, CACHE_LINE_SIZE).ok_or(BufferError::OutOfMemory { requested: bytes })
    }
}

impl DeviceRuntime for HostEmulatedRuntime {
    fn alloc_pinned_host(&self, bytes: usize) -> BufferResult<NonNull<u8>> {
        let ptr = self.alloc(bytes)?;
        self.pinned_bytes.fetch_add(bytes, Ordering::AcqRel);
        Ok(ptr)
    }

    unsafe fn free_pinned_host(&self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: contract forwarded from the caller
        unsafe { free_host(ptr, bytes, CACHE_LINE_SIZE) };
        self.pinned_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn alloc_device(&self, bytes: usize, _device: DeviceId) -> BufferResult<NonNull<u8>> {
        let ptr = self.alloc(bytes)?;
        self.device_bytes.fetch_add(bytes, Ordering::AcqRel);
        Ok(ptr)
    }

    unsafe fn free_device(&self, ptr: NonNull<u8>, bytes: usize, _device: DeviceId) {
        // SAFETY: contract forwarded from the caller
        unsafe { free_host(ptr, bytes, CACHE_LINE_SIZE) };
        self.device_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    unsafe fn copy_host_to_device(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        _device: DeviceId,
    ) -> BufferResult<()> {
        // SAFETY: contract forwarded from the caller; emulated device
        // memory is host memory.
        unsafe { ptr::copy_nonoverlapping(src, dst, bytes) };
        self.copies.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    unsafe fn copy_device_to_host(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        _device: DeviceId,
    ) -> BufferResult<()> {
        // SAFETY: contract forwarded from the caller; emulated device
        // memory is host memory.
        unsafe { ptr::copy_nonoverlapping(src, dst, bytes) };
        self.copies.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        _dst_device: DeviceId,
        _src_device: DeviceId,
    ) -> BufferResult<()> {
        // SAFETY: contract forwarded from the caller; emulated device
        // memory is host memory.
        unsafe { ptr::copy_nonoverlapping(src, dst, bytes) };
        self.copies.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
