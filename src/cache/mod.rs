//! Page caching
//!
//! [`page_cache`] holds the multi-device write-through cache.

mod page_cache;

pub use page_cache::{CacheStats, CacheStatsSnapshot, PageCache, PageCacheConfig, PinnedPage};
