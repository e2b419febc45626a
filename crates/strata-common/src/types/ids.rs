//! Core identifier types for the strata storage tiers.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types, plus the small
//! enums naming a manager's tier and the memory space its slabs live in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device identifier - names the physical device a manager serves.
///
/// Host-memory managers conventionally use device 0; accelerator-memory
/// managers use the runtime's device ordinal.
///
/// # Example
///
/// ```rust
/// use strata_common::types::DeviceId;
///
/// let device = DeviceId::new(1);
/// assert_eq!(device.as_u32(), 1);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Invalid device ID, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// Conventional device ID for host-memory managers.
    pub const HOST: Self = Self(0);

    /// Creates a new `DeviceId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a valid device ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "DeviceId(INVALID)")
        } else {
            write!(f, "DeviceId({})", self.0)
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl From<DeviceId> for u32 {
    #[inline]
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Buffer identifier - uniquely identifies a buffer within one manager.
///
/// Issued monotonically per manager instance; distinct manager instances
/// issue overlapping IDs, so a `BufferId` is only meaningful alongside the
/// manager that issued it.
///
/// # Example
///
/// ```rust
/// use strata_common::types::BufferId;
///
/// let id = BufferId::new(7);
/// assert_eq!(id.next().as_u64(), 8);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BufferId(u64);

impl BufferId {
    /// Invalid buffer ID, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// First buffer ID a manager issues.
    pub const FIRST: Self = Self(0);

    /// Creates a new `BufferId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next buffer ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid buffer ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "BufferId(INVALID)")
        } else {
            write!(f, "BufferId({})", self.0)
        }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BufferId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<BufferId> for u64 {
    #[inline]
    fn from(id: BufferId) -> Self {
        id.0
    }
}

/// The kind of manager serving a storage tier.
///
/// Every tier in the hierarchy (file-backed, host memory, device memory)
/// implements the same abstract contract; `MgrKind` identifies which tier
/// a given instance is, mostly for diagnostics and routing decisions in
/// the coordinating layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MgrKind {
    /// File-backed persistence tier (the coldest tier).
    FileMgr,
    /// Host-memory cache tier.
    CpuMgr,
    /// Device-memory cache tier.
    GpuMgr,
}

impl MgrKind {
    /// Returns the short lowercase name of this manager kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileMgr => "file",
            Self::CpuMgr => "cpu",
            Self::GpuMgr => "gpu",
        }
    }
}

impl fmt::Display for MgrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The memory space a slab (and the buffers carved from it) lives in.
///
/// The space decides which allocation and copy routines apply when bytes
/// move between buffers of different tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    /// Plain host heap memory.
    Host,
    /// Page-locked host memory registered with a device runtime for DMA.
    PinnedHost,
    /// Device (accelerator) memory.
    Device,
}

impl MemorySpace {
    /// Returns true if a host pointer into this space can be dereferenced
    /// directly by CPU code.
    #[inline]
    #[must_use]
    pub const fn is_host_accessible(self) -> bool {
        matches!(self, Self::Host | Self::PinnedHost)
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::PinnedHost => "pinned-host",
            Self::Device => "device",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id() {
        let device = DeviceId::new(3);
        assert_eq!(device.as_u32(), 3);
        assert!(device.is_valid());
        assert!(!DeviceId::INVALID.is_valid());
        assert_eq!(DeviceId::HOST.as_u32(), 0);
    }

    #[test]
    fn test_buffer_id() {
        let id = BufferId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(id.is_valid());
        assert!(!BufferId::INVALID.is_valid());

        let next = id.next();
        assert_eq!(next.as_u64(), 43);
    }

    #[test]
    fn test_mgr_kind_names() {
        assert_eq!(MgrKind::FileMgr.as_str(), "file");
        assert_eq!(MgrKind::CpuMgr.as_str(), "cpu");
        assert_eq!(MgrKind::GpuMgr.as_str(), "gpu");
        assert_eq!(MgrKind::CpuMgr.to_string(), "cpu");
    }

    #[test]
    fn test_memory_space_accessibility() {
        assert!(MemorySpace::Host.is_host_accessible());
        assert!(MemorySpace::PinnedHost.is_host_accessible());
        assert!(!MemorySpace::Device.is_host_accessible());
    }

    #[test]
    fn test_ordering() {
        assert!(BufferId::new(1) < BufferId::new(2));
        assert!(DeviceId::new(0) < DeviceId::new(1));
    }
}
