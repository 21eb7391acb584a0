//! JSON configuration: pool name to size.
//!
//! The file is a flat object mapping each pool name to either a plain
//! megabyte count or a detailed entry:
//!
//! ```json
//! {
//!     "default": 64,
//!     "images": { "size_mb": 256, "region_mb": 16, "chunk_mb": 4 }
//! }
//! ```

use crate::pool::PoolConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Detailed pool entry with optional geometry overrides.
///
/// Unknown keys are rejected, so a typo'd field fails the whole parse
/// instead of silently falling back to a default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolDetail {
    /// Pool limit in MiB.
    pub size_mb: u64,
    /// Region size in MiB.
    #[serde(default)]
    pub region_mb: Option<u64>,
    /// Chunk size in MiB.
    #[serde(default)]
    pub chunk_mb: Option<u64>,
}

/// One pool's configuration entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PoolEntry {
    /// Shorthand: just the pool limit in MiB.
    SizeMb(u64),
    /// Full form with optional geometry overrides.
    Detailed(PoolDetail),
}

impl PoolEntry {
    /// Pool limit in bytes.
    pub fn limit_bytes(&self) -> u64 {
        let mb = match self {
            Self::SizeMb(mb) => *mb,
            Self::Detailed(detail) => detail.size_mb,
        };
        mb << 20
    }

    /// Expand into a full [`PoolConfig`], starting from `defaults`.
    pub fn pool_config(&self, defaults: &PoolConfig) -> PoolConfig {
        let mut cfg = defaults.clone();
        cfg.limit_bytes = self.limit_bytes();
        if let Self::Detailed(detail) = self {
            if let Some(mb) = detail.region_mb {
                cfg.region_size = (mb as usize) << 20;
            }
            if let Some(mb) = detail.chunk_mb {
                cfg.chunk_size = (mb as usize) << 20;
            }
        }
        cfg
    }
}

/// Parsed cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CacheConfig {
    /// Pool name to entry.
    pub pools: HashMap<String, PoolEntry>,
}

impl CacheConfig {
    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad cache config: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_shorthand_and_detailed() {
        let raw = r#"{
            "default": 64,
            "images": { "size_mb": 256, "region_mb": 16 }
        }"#;
        let cfg: CacheConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.pools["default"], PoolEntry::SizeMb(64));
        assert_eq!(cfg.pools["default"].limit_bytes(), 64 << 20);

        let defaults = PoolConfig::default();
        let images = cfg.pools["images"].pool_config(&defaults);
        assert_eq!(images.limit_bytes, 256 << 20);
        assert_eq!(images.region_size, 16 << 20);
        assert_eq!(images.chunk_size, defaults.chunk_size);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"p": 4}}"#).unwrap();
        let cfg = CacheConfig::load(file.path()).unwrap();
        assert_eq!(cfg.pools["p"].limit_bytes(), 4 << 20);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(CacheConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_rejects_unknown_field() {
        // A typo'd key must fail the parse, not fall back to defaults.
        let raw = r#"{"images": { "size_mb": 256, "regio_mb": 16 }}"#;
        assert!(serde_json::from_str::<CacheConfig>(raw).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{raw}").unwrap();
        assert!(CacheConfig::load(file.path()).is_err());
    }
}
