//! Log readers and read modes
//!
//! A reader iterates slots in `[start, bound)`, where the bound depends
//! on the read mode: `Speculative` readers chase `commit_pos`,
//! `Durable` readers chase `flush_pos`. A reader of mode M that has
//! observed offset `p` guarantees everything in `[start, p)` is
//! readable with the durability of M.

use std::sync::Arc;

use crate::device::LogStorage;
use crate::error::Result;
use crate::log::log_device::LogShared;
use crate::log::slot::SlotRange;

/// Durability mode of a log reader, weak to strong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogReadMode {
    /// May or may not observe committed data; no durability claim.
    Inconsistent,
    /// Observes `commit_pos`: all committed data, durable or not.
    Speculative,
    /// Observes `flush_pos`: only data a crash cannot take back.
    Durable,
}

/// Sequential slot reader over one log.
///
/// Not thread-safe; create one reader per thread. The underlying log
/// may be appended to concurrently; each `read_next` re-samples the
/// mode's bound.
pub struct LogReader<D: LogStorage> {
    shared: Arc<LogShared<D>>,
    mode: LogReadMode,
    position: u64,
}

impl<D: LogStorage> LogReader<D> {
    pub(crate) fn new(shared: Arc<LogShared<D>>, mode: LogReadMode, start: u64) -> Self {
        Self {
            shared,
            mode,
            position: start,
        }
    }

    /// The reader's durability mode.
    #[inline]
    pub fn mode(&self) -> LogReadMode {
        self.mode
    }

    /// Offset of the next unread slot.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    fn bound(&self) -> u64 {
        match self.mode {
            LogReadMode::Inconsistent | LogReadMode::Speculative => {
                self.shared.commit_watch.get()
            }
            LogReadMode::Durable => {
                if self.shared.poisoned() {
                    // The sentinel would otherwise read as "everything".
                    0
                } else {
                    self.shared.flush_watch.get()
                }
            }
        }
    }

    /// Read the next slot, or `None` at the mode's bound.
    pub fn read_next(&mut self) -> Result<Option<(SlotRange, Vec<u8>)>> {
        match self.shared.read_slot_at(self.position, self.bound())? {
            Some((range, payload)) => {
                self.position = range.hi;
                Ok(Some((range, payload)))
            }
            None => Ok(None),
        }
    }

    /// Skip to `offset` without reading. The offset must be a slot
    /// boundary; a misaligned skip surfaces as corruption on the next
    /// read.
    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    /// Drain all remaining slots into a vector.
    pub fn read_to_end(&mut self) -> Result<Vec<(SlotRange, Vec<u8>)>> {
        let mut slots = Vec::new();
        while let Some(slot) = self.read_next()? {
            slots.push(slot);
        }
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::log::{LogDevice, LogDeviceConfig};

    fn mem_log(capacity: u64) -> LogDevice<MemoryDevice> {
        LogDevice::create(Arc::new(MemoryDevice::new()), LogDeviceConfig::new(capacity)).unwrap()
    }

    #[test]
    fn test_speculative_sees_unflushed() {
        let log = mem_log(4096);
        log.append(b"one").unwrap();
        log.append(b"two").unwrap();

        let mut reader = log.new_reader(LogReadMode::Speculative);
        let collected: Vec<Vec<u8>> = reader
            .read_to_end()
            .unwrap()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(collected, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_durable_bound_lags_commit() {
        let log = mem_log(4096);
        log.append(b"flushed").unwrap();
        log.sync_flush().unwrap();
        log.append(b"committed-only").unwrap();

        let mut durable = log.new_reader(LogReadMode::Durable);
        let slots = durable.read_to_end().unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].1, b"flushed");

        let mut speculative = log.new_reader(LogReadMode::Speculative);
        assert_eq!(speculative.read_to_end().unwrap().len(), 2);
    }

    #[test]
    fn test_reader_resumes_after_bound() {
        let log = mem_log(4096);
        log.append(b"a").unwrap();

        let mut reader = log.new_reader(LogReadMode::Speculative);
        assert!(reader.read_next().unwrap().is_some());
        assert!(reader.read_next().unwrap().is_none());

        // New appends become visible to the same reader.
        log.append(b"b").unwrap();
        let (_, payload) = reader.read_next().unwrap().unwrap();
        assert_eq!(payload, b"b");
    }

    #[test]
    fn test_mode_ordering() {
        assert!(LogReadMode::Inconsistent < LogReadMode::Speculative);
        assert!(LogReadMode::Speculative < LogReadMode::Durable);
    }
}
