//! Error types for oxipage operations
//!
//! All fallible operations in the crate return [`Result`], whose error
//! type is the crate-wide [`OxipageError`]. Display strings are stable
//! and are what the CLI prints on failure.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OxipageError>;

/// Errors returned by oxipage components.
#[derive(Debug, Error)]
pub enum OxipageError {
    /// Underlying I/O error from a storage backend.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The log's active window cannot hold the record. Trim and retry.
    #[error("log out of space: need {need} bytes, {available} available")]
    NoSpace {
        /// Framed size of the rejected record.
        need: u64,
        /// Bytes currently available in the active window.
        available: u64,
    },

    /// Page, slot, or record does not exist (or its generation is stale).
    #[error("not found")]
    NotFound,

    /// Checksum or structural validation failed. Fatal to the component.
    #[error("corruption: {0}")]
    Corruption(&'static str),

    /// No free physical page indices remain on the device.
    #[error("page allocator exhausted")]
    Exhausted,

    /// The allocator's fixed-size attachment table has no free entry.
    #[error("attachment table full")]
    AttachmentTableFull,

    /// An update named a client uuid that is not attached.
    #[error("unknown client attachment")]
    UnknownClient,

    /// A refcount delta would overflow the counter.
    #[error("refcount overflow")]
    Overflow,

    /// Trim would cross a held slot read lock.
    #[error("trim to {requested} blocked by slot lock at {pinned}")]
    TrimPinned {
        /// Requested new trim position.
        requested: u64,
        /// Lower bound of the oldest held lock interval.
        pinned: u64,
    },

    /// Trim target lies beyond the flush position.
    #[error("trim to {requested} is beyond flush position {flush_pos}")]
    InvalidTrim {
        /// Requested new trim position.
        requested: u64,
        /// Current flush position.
        flush_pos: u64,
    },

    /// A recovered page structure is deeper than the configured bound.
    #[error("page reference depth exceeds limit {max_depth}")]
    DepthExceeded {
        /// Configured maximum traversal depth.
        max_depth: usize,
    },

    /// A page carries more out-references than the configured bound.
    #[error("page fanout exceeds limit {max_branching}")]
    FanoutExceeded {
        /// Configured maximum branching factor.
        max_branching: usize,
    },

    /// An awaitable was cancelled or timed out.
    #[error("cancelled")]
    Cancelled,

    /// A PageId failed validation against the device it was used on.
    #[error("invalid page id: {0}")]
    InvalidPageId(&'static str),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The component observed corruption earlier and refuses further work.
    #[error("component poisoned by earlier corruption")]
    Poisoned,

    /// The device or component has been shut down.
    #[error("closed")]
    Closed,

    /// TOML parse error while loading configuration.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A configuration value failed validation.
    #[error("invalid value for {key}: {value}")]
    InvalidConfig {
        /// Configuration key.
        key: String,
        /// Rejected value.
        value: String,
    },
}

impl OxipageError {
    /// Short stable kind string, independent of any embedded detail.
    pub const fn kind(&self) -> &'static str {
        match self {
            OxipageError::Io(_) => "IoError",
            OxipageError::NoSpace { .. } => "NoSpace",
            OxipageError::NotFound => "NotFound",
            OxipageError::Corruption(_) => "Corruption",
            OxipageError::Exhausted => "Exhausted",
            OxipageError::AttachmentTableFull => "AttachmentTableFull",
            OxipageError::UnknownClient => "UnknownClient",
            OxipageError::Overflow => "Overflow",
            OxipageError::TrimPinned { .. } => "TrimPinned",
            OxipageError::InvalidTrim { .. } => "InvalidTrim",
            OxipageError::DepthExceeded { .. } => "DepthExceeded",
            OxipageError::FanoutExceeded { .. } => "FanoutExceeded",
            OxipageError::Cancelled => "Cancelled",
            OxipageError::InvalidPageId(_) => "InvalidPageId",
            OxipageError::InvalidArgument(_) => "InvalidArgument",
            OxipageError::Poisoned => "Poisoned",
            OxipageError::Closed => "Closed",
            OxipageError::Toml(_) => "ConfigError",
            OxipageError::InvalidConfig { .. } => "ConfigError",
        }
    }

    /// Whether the error is transient backpressure the caller may retry
    /// after trimming or recycling.
    #[inline]
    pub const fn is_backpressure(&self) -> bool {
        matches!(
            self,
            OxipageError::NoSpace { .. } | OxipageError::Exhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(OxipageError::NotFound.kind(), "NotFound");
        assert_eq!(
            OxipageError::NoSpace {
                need: 10,
                available: 2
            }
            .kind(),
            "NoSpace"
        );
        assert_eq!(OxipageError::Corruption("bad crc").kind(), "Corruption");
        assert_eq!(OxipageError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn test_backpressure() {
        assert!(OxipageError::Exhausted.is_backpressure());
        assert!(OxipageError::NoSpace {
            need: 1,
            available: 0
        }
        .is_backpressure());
        assert!(!OxipageError::NotFound.is_backpressure());
    }

    #[test]
    fn test_display_is_stable() {
        let err = OxipageError::NoSpace {
            need: 128,
            available: 64,
        };
        assert_eq!(
            err.to_string(),
            "log out of space: need 128 bytes, 64 available"
        );
        assert_eq!(
            OxipageError::Corruption("slot crc mismatch").to_string(),
            "corruption: slot crc mismatch"
        );
    }
}
