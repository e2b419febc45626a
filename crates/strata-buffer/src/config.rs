//! Buffer pool configuration.

use serde::{Deserialize, Serialize};
use strata_common::constants::{
    DEFAULT_PAGE_SIZE, DEFAULT_POOL_SIZE, DEFAULT_SLAB_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use strata_common::types::DeviceId;

/// Configuration for one buffer pool instance.
///
/// Sizing works top-down: `max_buffer_size` is the pool's total budget,
/// carved into slabs of (at most) `slab_size` bytes, each subdivided into
/// pages of `page_size` bytes. A slab never exceeds the budget, so a tiny
/// pool simply has one slab covering all of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Device this pool serves.
    pub device_id: DeviceId,
    /// Total memory budget in bytes.
    pub max_buffer_size: usize,
    /// Requested slab size in bytes (clamped to the budget).
    pub slab_size: usize,
    /// Allocation granule in bytes.
    pub page_size: usize,
}

impl BufferPoolConfig {
    /// Creates a configuration with the given memory budget and defaults
    /// for everything else.
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            device_id: DeviceId::HOST,
            max_buffer_size,
            slab_size: DEFAULT_SLAB_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the device id.
    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    /// Sets the slab size.
    pub fn with_slab_size(mut self, slab_size: usize) -> Self {
        self.slab_size = slab_size;
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Number of pages in one slab.
    ///
    /// The requested slab size is clamped to the budget and rounded down
    /// to a whole number of pages.
    pub fn pages_per_slab(&self) -> usize {
        self.slab_size.min(self.max_buffer_size) / self.page_size
    }

    /// Effective slab size in bytes (a whole number of pages).
    pub fn slab_bytes(&self) -> usize {
        self.pages_per_slab() * self.page_size
    }

    /// Maximum number of slabs this pool may allocate.
    pub fn max_num_slabs(&self) -> usize {
        let slab_bytes = self.slab_bytes();
        if slab_bytes == 0 {
            0
        } else {
            (self.max_buffer_size / slab_bytes).max(1)
        }
    }

    /// Maximum number of pages across all slabs.
    pub fn max_num_pages(&self) -> usize {
        self.max_num_slabs() * self.pages_per_slab()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first constraint violated.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.page_size.is_power_of_two() {
            return Err("page_size must be a power of 2");
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err("page_size too small");
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err("page_size too large");
        }
        if self.slab_size < self.page_size {
            return Err("slab_size must hold at least one page");
        }
        if self.max_buffer_size < self.page_size {
            return Err("max_buffer_size must hold at least one page");
        }
        Ok(())
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = BufferPoolConfig::new(DEFAULT_POOL_SIZE);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.slab_size, DEFAULT_SLAB_SIZE);
        assert!(config.validate().is_ok());
        assert_eq!(config.pages_per_slab(), DEFAULT_SLAB_SIZE / DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_num_slabs(), DEFAULT_POOL_SIZE / DEFAULT_SLAB_SIZE);
    }

    #[test]
    fn test_config_builder() {
        let config = BufferPoolConfig::new(1 << 20)
            .with_device(DeviceId::new(2))
            .with_slab_size(1 << 16)
            .with_page_size(4096);

        assert_eq!(config.device_id, DeviceId::new(2));
        assert_eq!(config.slab_size, 1 << 16);
        assert_eq!(config.page_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slab_clamped_to_budget() {
        // Three pages of budget with the default (huge) slab size: the
        // single slab covers the whole pool.
        let config = BufferPoolConfig::new(3 * 512).with_page_size(512);
        assert_eq!(config.pages_per_slab(), 3);
        assert_eq!(config.slab_bytes(), 3 * 512);
        assert_eq!(config.max_num_slabs(), 1);
        assert_eq!(config.max_num_pages(), 3);
    }

    #[test]
    fn test_multi_slab_budget() {
        let config = BufferPoolConfig::new(10 * 512)
            .with_page_size(512)
            .with_slab_size(4 * 512);
        assert_eq!(config.pages_per_slab(), 4);
        // 10 pages of budget at 4 pages per slab: two whole slabs fit.
        assert_eq!(config.max_num_slabs(), 2);
        assert_eq!(config.max_num_pages(), 8);
    }

    #[test]
    fn test_validation() {
        let config = BufferPoolConfig::new(1 << 20).with_page_size(500);
        assert!(config.validate().is_err());

        let config = BufferPoolConfig::new(256).with_page_size(512);
        assert!(config.validate().is_err());

        let config = BufferPoolConfig::new(1 << 20)
            .with_page_size(512)
            .with_slab_size(100);
        assert!(config.validate().is_err());
    }
}
