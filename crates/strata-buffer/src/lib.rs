//! # strata-buffer
//!
//! Slab-based buffer pool for one memory tier of the strata storage
//! stack.
//!
//! A [`BufferPool`] carves large slabs of tier memory (host heap,
//! page-locked host memory, or device memory) into page-granular
//! segments and hands them out as [`Buffer`] handles keyed by
//! [`ChunkKey`](strata_common::types::ChunkKey). When a tier fills up,
//! the pool evicts the coldest contiguous run of unpinned buffers to
//! make room, so hot working sets stay resident without any manual
//! memory management by callers.
//!
//! ```text
//!             create / get / delete (by chunk key)
//!                           |
//!                           v
//!   +--------------------- BufferPool ----------------------+
//!   | chunk index      segment table         slab source    |
//!   | key -> buffer    per-slab segments     heap / device  |
//!   +--------------------------------------------------------+
//!        |                                        |
//!        v                                        v
//!   Buffer handles  <---  pinned bytes  ---  slabs on tier
//! ```
//!
//! Pools compose into a tier hierarchy through the [`BufferMgr`] trait:
//! a GPU pool can name a CPU pool as its parent and `checkpoint` dirty
//! chunks down to it.
//!
//! ## Example
//!
//! ```rust
//! use strata_buffer::{BufferPool, BufferPoolConfig};
//! use strata_common::types::ChunkKey;
//!
//! let pool = BufferPool::cpu(BufferPoolConfig::new(1 << 20))?;
//! let key = ChunkKey::new(&[1, 7, 0, 3]);
//! let buf = pool.create_buffer(&key, 0, 0)?;
//! buf.write(b"column bytes", 0)?;
//!
//! let again = pool.get_buffer(&key, 0)?;
//! let mut out = [0u8; 12];
//! again.read(&mut out, 0)?;
//! assert_eq!(&out, b"column bytes");
//! # Ok::<(), strata_buffer::BufferError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod buffer;
mod segment;
mod slab;

pub mod config;
pub mod error;
pub mod handle;
pub mod mgr;
pub mod pool;
pub mod runtime;
pub mod tier;

pub use config::BufferPoolConfig;
pub use error::{BufferError, BufferResult};
pub use handle::{Buffer, PinGuard};
pub use mgr::BufferMgr;
pub use pool::{BufferPool, BufferPoolStats};
pub use runtime::{DeviceRuntime, HostEmulatedRuntime};
pub use tier::{CpuHeapSource, DeviceSource, PinnedHostSource, SlabSource};
