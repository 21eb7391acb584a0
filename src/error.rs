//! Error types for cache operations.

use std::fmt;

/// Errors that can occur during cache operations.
///
/// Soft-pointer faults and plain cache misses are *not* errors: the hot-path
/// APIs report them through `Option` / `bool` returns. This enum covers the
/// synchronous failures a caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No region could be obtained, even via overcommit.
    OutOfMemory,

    /// Key not found (for ordered-set reads on absent keys).
    KeyNotFound,

    /// Element already exists (for `zadd` with `UpdateType::NotExist`).
    ElementExists,

    /// Element not found (for `zadd` with `UpdateType::Exist`).
    ElementNotFound,

    /// Range arguments out of bounds (`start < 0`, `end >= count`, or
    /// `start > end`).
    InvalidRange,

    /// A pool with this name already exists.
    PoolExists,

    /// The pool is still referenced and cannot be deleted.
    PoolBusy,

    /// Stored value bytes did not parse as the expected layout.
    Corrupted,

    /// Control-plane request failed or the daemon connection is down.
    ControlPlane,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::ElementExists => write!(f, "element already exists"),
            Self::ElementNotFound => write!(f, "element not found"),
            Self::InvalidRange => write!(f, "range out of bounds"),
            Self::PoolExists => write!(f, "pool already exists"),
            Self::PoolBusy => write!(f, "pool is still referenced"),
            Self::Corrupted => write!(f, "stored value corrupted"),
            Self::ControlPlane => write!(f, "control plane failure"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CacheError::OutOfMemory), "out of memory");
        assert_eq!(format!("{}", CacheError::KeyNotFound), "key not found");
        assert_eq!(
            format!("{}", CacheError::InvalidRange),
            "range out of bounds"
        );
        assert_eq!(format!("{}", CacheError::PoolExists), "pool already exists");
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<CacheError>();
    }

    #[test]
    fn test_cache_result() {
        let ok: CacheResult<u32> = Ok(7);
        assert!(matches!(ok, Ok(7)));
        let err: CacheResult<u32> = Err(CacheError::ElementExists);
        assert!(matches!(err, Err(CacheError::ElementExists)));
    }
}
