//! Bounded sliding-window logs
//!
//! The log layer: slot framing and read locks ([`slot`]), the device
//! itself ([`log_device`]), and readers ([`reader`]).

pub(crate) mod log_device;
mod reader;
pub mod slot;

pub use log_device::{
    FlushBarrier, LogDevice, LogDeviceConfig, LogStats, PositionKind, CONTROL_BLOCK_SIZE,
};
pub use reader::{LogReadMode, LogReader};
pub use slot::{SlotRange, SlotReadLock};
