//! # strata-common
//!
//! Common types, constants, and utilities shared by the strata storage tiers.
//!
//! This crate provides the foundational vocabulary used across every buffer
//! manager in the stack:
//!
//! - **Types**: chunk identity (`ChunkKey`), chunk metadata snapshots, and
//!   type-safe identifiers (`DeviceId`, `BufferId`)
//! - **Tier vocabulary**: `MgrKind` and `MemorySpace` describing where a
//!   manager sits and what memory its slabs live in
//! - **Constants**: page/slab sizing defaults and limits
//! - **Memory**: aligned host allocation used for heap-backed slabs
//!
//! ## Example
//!
//! ```rust
//! use strata_common::types::{ChunkKey, DeviceId};
//!
//! let key = ChunkKey::new(&[1, 7, 0, 3]);
//! assert!(key.starts_with(&ChunkKey::new(&[1, 7])));
//! let device = DeviceId::new(0);
//! assert!(device.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod memory;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{BufferId, ChunkKey, ChunkMetadata, DeviceId, MemorySpace, MgrKind};
