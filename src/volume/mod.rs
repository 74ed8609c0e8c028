//! Atomic multi-page transactions
//!
//! Record formats in [`records`], the staging buffer in [`job`], and
//! the volume itself in [`volume`].

pub mod job;
pub mod records;
#[allow(clippy::module_inception)]
pub(crate) mod volume;

pub use job::{CommitReceipt, PageCacheJob};
pub use records::{PrepareRecord, VolumeRecord};
pub use volume::{Volume, VolumeConfig, VolumeRecoveryReport};
