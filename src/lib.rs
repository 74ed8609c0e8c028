//! oxipage - low-level building blocks for external data structures on
//! block- and log-based storage
//!
//! This crate sits between raw block devices and a full filesystem or
//! database. It provides:
//! - **LogDevice**: bounded sliding-window append logs with trim /
//!   flush / commit pointers and read-mode durability
//! - **PageDevice**: fixed-size pages addressed by physical index +
//!   generation, immutable per [`PageId`]
//! - **PageAllocator**: crash-safe refcounts with an exactly-once
//!   client update protocol
//! - **PageRecycler**: durable bounded-depth reclamation of
//!   transitively unreachable pages
//! - **PageCache** and **Volume**/**PageCacheJob**: a pinning
//!   write-through cache and an atomic multi-page + log-record
//!   transaction primitive
//!
//! Every operation stays well-defined across arbitrary mid-write
//! crashes; recovery is replay of the relevant logs.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxipage::prelude::*;
//!
//! let volume = Volume::create(device, config, cache, allocators)?;
//! let mut job = volume.new_job();
//! let page = job.new_page(0)?;
//! job.write_page(page, b"contents")?;
//! job.append(b"record");
//! let receipt = job.commit()?;
//! ```

#![warn(missing_docs)]

pub mod allocator;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod log;
pub mod page;
pub mod page_id;
pub mod recycler;
pub mod sync;
mod utility;
pub mod volume;

// Re-exports for convenience
pub use error::{OxipageError, Result};
pub use page_id::PageId;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::allocator::{PageAllocator, PageAllocatorConfig, PageDelta};
    pub use crate::cache::{PageCache, PageCacheConfig, PinnedPage};
    pub use crate::device::{FileDevice, LogStorage, MemoryDevice, PageFile, PageStorage};
    pub use crate::error::{OxipageError, Result};
    pub use crate::log::{LogDevice, LogDeviceConfig, LogReadMode, SlotRange};
    pub use crate::page::PageDevice;
    pub use crate::page_id::PageId;
    pub use crate::recycler::{PageRecycler, PageRecyclerConfig, PageTracer};
    pub use crate::volume::{PageCacheJob, Volume, VolumeConfig};
}
