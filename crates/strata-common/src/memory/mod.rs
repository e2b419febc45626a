//! Memory management utilities for the strata storage tiers.
//!
//! Host-memory slabs come from the aligned allocation primitives here;
//! pinned-host and device slabs come from an injected device runtime and
//! never touch this module.

mod aligned;

pub use aligned::{alloc_host_zeroed, free_host, CACHE_LINE_SIZE, SLAB_ALIGNMENT};
