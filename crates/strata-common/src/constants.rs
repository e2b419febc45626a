//! System-wide constants for the strata storage tiers.
//!
//! This module defines sizing defaults used across the buffer managers.
//! The defaults mirror what a columnar workload wants: small pages so a
//! short chunk wastes little, huge slabs so allocation stays coarse.

// =============================================================================
// Page Constants
// =============================================================================

/// Default buffer page size in bytes (512 B).
///
/// Chunk sizes in a columnar store vary wildly (a dictionary-encoded column
/// fragment can be a few hundred bytes), so the allocation granule is kept
/// small. This is an accounting unit, not an I/O unit.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Minimum page size in bytes.
pub const MIN_PAGE_SIZE: usize = 64;

/// Maximum page size in bytes (16 MB).
pub const MAX_PAGE_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Slab Constants
// =============================================================================

/// Default slab size in bytes (2 GB).
///
/// Slabs are the unit of physical growth: one slab is one allocation from
/// the tier's memory source, subdivided into pages and never resized.
pub const DEFAULT_SLAB_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Default total pool size in bytes (4 GB).
pub const DEFAULT_POOL_SIZE: usize = 4 * 1024 * 1024 * 1024;

// =============================================================================
// Chunk Key Constants
// =============================================================================

/// Number of chunk-key components stored inline without heap allocation.
///
/// Keys are commonly `{db_id, table_id, fragment_id, column_id}`; longer
/// keys (varlen sub-chunks) spill to the heap.
pub const CHUNK_KEY_INLINE_LEN: usize = 4;
