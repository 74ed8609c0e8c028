//! Configuration loading helpers.
//!
//! Component configs all have code-level `Default`s; this module adds
//! the TOML schema used by the CLI's volume-directory manifest and by
//! applications that prefer file-driven setup. Every field is optional
//! and falls back to the component default.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::allocator::PageAllocatorConfig;
use crate::cache::PageCacheConfig;
use crate::error::{OxipageError, Result};
use crate::recycler::PageRecyclerConfig;
use crate::utility::is_power_of_two;
use crate::volume::VolumeConfig;

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OxipageConfig {
    /// Volume settings.
    pub volume: Option<VolumeSpec>,
    /// Page cache settings.
    pub cache: Option<CacheSpec>,
    /// Allocator / page device settings.
    pub allocator: Option<AllocatorSpec>,
    /// Recycler settings.
    pub recycler: Option<RecyclerSpec>,
}

/// `[volume]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VolumeSpec {
    /// Volume log capacity in bytes.
    pub log_capacity: Option<u64>,
}

/// `[cache]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheSpec {
    /// Maximum resident entries.
    pub capacity: Option<usize>,
}

/// `[allocator]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AllocatorSpec {
    /// Physical pages per device.
    pub page_count: Option<u32>,
    /// Page size in bytes (power of two, >= 512).
    pub page_size: Option<usize>,
    /// Attachment table capacity.
    pub max_attachments: Option<usize>,
}

/// `[recycler]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecyclerSpec {
    /// Maximum out-references per page.
    pub max_branching_factor: Option<usize>,
    /// Maximum traversal depth.
    pub max_depth: Option<usize>,
}

impl OxipageConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the `OXIPAGE_CONFIG` env var if set, defaults otherwise.
    pub fn load_from_env() -> Result<Self> {
        match env::var("OXIPAGE_CONFIG") {
            Ok(path) => Self::load_from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Write the configuration as TOML.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let contents = toml::to_string_pretty(self).map_err(|err| OxipageError::InvalidConfig {
            key: "config".into(),
            value: err.to_string(),
        })?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(capacity) = self.volume.as_ref().and_then(|v| v.log_capacity) {
            if capacity == 0 || capacity % 8 != 0 {
                return Err(OxipageError::InvalidConfig {
                    key: "volume.log_capacity".into(),
                    value: capacity.to_string(),
                });
            }
        }
        if let Some(page_size) = self.allocator.as_ref().and_then(|a| a.page_size) {
            if !is_power_of_two(page_size as u64) || page_size < 512 {
                return Err(OxipageError::InvalidConfig {
                    key: "allocator.page_size".into(),
                    value: page_size.to_string(),
                });
            }
        }
        if let Some(depth) = self.recycler.as_ref().and_then(|r| r.max_depth) {
            if depth == 0 {
                return Err(OxipageError::InvalidConfig {
                    key: "recycler.max_depth".into(),
                    value: "0".into(),
                });
            }
        }
        Ok(())
    }

    /// Resolved volume config.
    pub fn volume_config(&self) -> VolumeConfig {
        let mut config = VolumeConfig::default();
        if let Some(capacity) = self.volume.as_ref().and_then(|v| v.log_capacity) {
            config.log_capacity = capacity;
        }
        config
    }

    /// Resolved cache config.
    pub fn cache_config(&self) -> PageCacheConfig {
        let mut config = PageCacheConfig::default();
        if let Some(capacity) = self.cache.as_ref().and_then(|c| c.capacity) {
            config.capacity = capacity;
        }
        config
    }

    /// Resolved allocator config.
    pub fn allocator_config(&self) -> PageAllocatorConfig {
        let page_count = self
            .allocator
            .as_ref()
            .and_then(|a| a.page_count)
            .unwrap_or(1024);
        let mut config = PageAllocatorConfig::new(page_count);
        if let Some(max_attachments) = self.allocator.as_ref().and_then(|a| a.max_attachments) {
            config.max_attachments = max_attachments;
        }
        config
    }

    /// Configured page size for page devices.
    pub fn page_size(&self) -> usize {
        self.allocator
            .as_ref()
            .and_then(|a| a.page_size)
            .unwrap_or(4096)
    }

    /// Resolved recycler config.
    pub fn recycler_config(&self) -> PageRecyclerConfig {
        let mut config = PageRecyclerConfig::default();
        if let Some(b) = self
            .recycler
            .as_ref()
            .and_then(|r| r.max_branching_factor)
        {
            config.max_branching_factor = b;
        }
        if let Some(d) = self.recycler.as_ref().and_then(|r| r.max_depth) {
            config.max_depth = d;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OxipageConfig::default();
        assert_eq!(config.volume_config().log_capacity, 1 << 20);
        assert_eq!(config.cache_config().capacity, 1024);
        assert_eq!(config.allocator_config().page_count, 1024);
        assert_eq!(config.page_size(), 4096);
        assert_eq!(config.recycler_config().max_depth, 8);
    }

    #[test]
    fn test_parse_toml() {
        let parsed: OxipageConfig = toml::from_str(
            r#"
            [volume]
            log_capacity = 65536

            [cache]
            capacity = 32

            [allocator]
            page_count = 64
            page_size = 512

            [recycler]
            max_branching_factor = 4
            max_depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.volume_config().log_capacity, 65536);
        assert_eq!(parsed.cache_config().capacity, 32);
        assert_eq!(parsed.allocator_config().page_count, 64);
        assert_eq!(parsed.page_size(), 512);
        let recycler = parsed.recycler_config();
        assert_eq!(recycler.max_branching_factor, 4);
        assert_eq!(recycler.max_depth, 3);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oxipage.toml");

        let config = OxipageConfig {
            allocator: Some(AllocatorSpec {
                page_count: Some(128),
                page_size: Some(1024),
                max_attachments: None,
            }),
            ..Default::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = OxipageConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.allocator_config().page_count, 128);
        assert_eq!(loaded.page_size(), 1024);
    }

    #[test]
    fn test_invalid_page_size_rejected() {
        let config = OxipageConfig {
            allocator: Some(AllocatorSpec {
                page_count: None,
                page_size: Some(1000),
                max_attachments: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let parsed: OxipageConfig = toml::from_str("[volume]\nlog_capacity = 7\n").unwrap();
        assert!(parsed.validate().is_err());
    }
}
