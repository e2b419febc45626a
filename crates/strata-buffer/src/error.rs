//! Buffer pool errors.

use strata_common::types::ChunkKey;
use thiserror::Error;

/// Result type for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during buffer pool operations.
///
/// Caller protocol violations (unpinning past zero, deleting a pinned
/// chunk) are not represented here: those are fatal assertions, since they
/// indicate memory-safety-relevant corruption risk rather than a
/// recoverable condition.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BufferError {
    /// Chunk is not resident in this pool.
    #[error("chunk {key} not found in buffer pool")]
    NotFound { key: ChunkKey },

    /// A chunk with this key is already resident.
    #[error("chunk {key} already exists in buffer pool")]
    DuplicateKey { key: ChunkKey },

    /// No segment could be reserved: free space, eviction, and slab
    /// growth were all exhausted.
    #[error("out of buffer memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    /// Byte range lies outside the buffer's logical size.
    #[error("range at offset {offset} of {len} bytes exceeds buffer size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The handle refers to a buffer whose segment was deleted or evicted.
    #[error("buffer is detached (its segment was deleted or evicted)")]
    Detached,

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Device runtime failure other than an allocation failure.
    #[error("device runtime error: {message}")]
    DeviceRuntime { message: String },
}

impl BufferError {
    /// Creates a not-found error for `key`.
    pub fn not_found(key: &ChunkKey) -> Self {
        Self::NotFound { key: key.clone() }
    }

    /// Creates a duplicate-key error for `key`.
    pub fn duplicate_key(key: &ChunkKey) -> Self {
        Self::DuplicateKey { key: key.clone() }
    }

    /// Creates an out-of-memory error for a request of `requested` bytes.
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Creates an out-of-bounds error.
    pub fn out_of_bounds(offset: usize, len: usize, size: usize) -> Self {
        Self::OutOfBounds { offset, len, size }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a device runtime error.
    pub fn device_runtime(message: impl Into<String>) -> Self {
        Self::DeviceRuntime {
            message: message.into(),
        }
    }

    /// Returns true if this is a transient error that the caller may retry,
    /// typically after freeing or checkpointing resident chunks.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let key = ChunkKey::new(&[1, 2, 3]);
        let err = BufferError::not_found(&key);
        assert!(matches!(
            err,
            BufferError::NotFound { key: k } if k == key
        ));
    }

    #[test]
    fn test_is_retryable() {
        assert!(BufferError::out_of_memory(4096).is_retryable());
        assert!(!BufferError::not_found(&ChunkKey::new(&[1])).is_retryable());
        assert!(!BufferError::Detached.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = BufferError::out_of_bounds(512, 100, 256);
        let text = err.to_string();
        assert!(text.contains("512"));
        assert!(text.contains("256"));
    }
}
