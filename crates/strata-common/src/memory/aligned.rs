//! Aligned host allocation for slab memory.
//!
//! Slabs are huge (gigabyte-scale) and long-lived, so they are allocated
//! raw rather than through a container: the slab registry owns the
//! pointer and frees it explicitly when the manager shuts down. Only the
//! allocate/release pair lives here; lifetime policy belongs to the
//! registry.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Cache line size on most modern CPUs.
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment for slab allocations (4 KB).
///
/// Page-aligning slabs keeps every page-granular offset within them
/// page-aligned too, which downstream DMA registration wants.
pub const SLAB_ALIGNMENT: usize = 4096;

/// Allocates `size` bytes of zeroed host memory with the given alignment.
///
/// Returns `None` if the allocator cannot satisfy the request, so callers
/// can surface allocation failure as an out-of-memory condition instead
/// of aborting.
///
/// # Panics
///
/// Panics if `size` is zero or `alignment` is not a power of two.
///
/// # Example
///
/// ```rust
/// use strata_common::memory::{alloc_host_zeroed, free_host, SLAB_ALIGNMENT};
///
/// let ptr = alloc_host_zeroed(4096, SLAB_ALIGNMENT).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % SLAB_ALIGNMENT, 0);
/// unsafe { free_host(ptr, 4096, SLAB_ALIGNMENT) };
/// ```
#[must_use]
pub fn alloc_host_zeroed(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    assert!(size > 0, "size must be greater than 0");
    assert!(alignment.is_power_of_two(), "alignment must be power of 2");

    let layout = Layout::from_size_align(size, alignment).ok()?;

    // SAFETY: layout has non-zero size (checked above)
    let ptr = unsafe { alloc::alloc_zeroed(layout) };

    NonNull::new(ptr)
}

/// Releases memory obtained from [`alloc_host_zeroed`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc_host_zeroed`] called with the
/// same `size` and `alignment`, and must not be used after this call.
pub unsafe fn free_host(ptr: NonNull<u8>, size: usize, alignment: usize) {
    let layout = Layout::from_size_align(size, alignment).expect("invalid layout in free");

    // SAFETY: caller guarantees ptr was allocated with this layout
    unsafe {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}
