//! Type definitions for the strata storage tiers.
//!
//! This module contains the identity and metadata types shared by every
//! buffer manager implementation.

mod chunk;
mod ids;

pub use chunk::{ChunkKey, ChunkMetadata};
pub use ids::{BufferId, DeviceId, MemorySpace, MgrKind};
