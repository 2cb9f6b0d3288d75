//! Last-error record and bounded history ring.

use crate::error::Error;

#[cfg(feature = "error-history")]
use crate::config::ERROR_HISTORY_SIZE;

/// Snapshot of one failure: what, on which tag, when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorRecord {
    pub code: Error,
    /// Tag the failing operation was addressing, 0 when not tag-specific.
    pub tag: u16,
    pub timestamp: u32,
}

#[derive(Default)]
pub(crate) struct Ledger {
    last: Option<ErrorRecord>,
    corruption_count: u32,
    #[cfg(feature = "error-history")]
    ring: [Option<ErrorRecord>; ERROR_HISTORY_SIZE],
    #[cfg(feature = "error-history")]
    head: usize,
}

impl Ledger {
    pub fn record(&mut self, code: Error, tag: u16, timestamp: u32) {
        let record = ErrorRecord { code, tag, timestamp };
        self.last = Some(record);
        if matches!(code, Error::CrcFailed | Error::Corrupted) {
            self.corruption_count += 1;
        }
        #[cfg(feature = "error-history")]
        {
            self.ring[self.head] = Some(record);
            self.head = (self.head + 1) % ERROR_HISTORY_SIZE;
        }
    }

    pub fn last(&self) -> Option<ErrorRecord> {
        self.last
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    pub fn corruption_count(&self) -> u32 {
        self.corruption_count
    }

    /// Copy the most recent records into `out`, newest first. Returns how
    /// many were written.
    #[cfg(feature = "error-history")]
    pub fn history(&self, out: &mut [ErrorRecord]) -> usize {
        let mut copied = 0;
        for i in 0..ERROR_HISTORY_SIZE {
            if copied == out.len() {
                break;
            }
            let idx = (self.head + ERROR_HISTORY_SIZE - 1 - i) % ERROR_HISTORY_SIZE;
            if let Some(record) = self.ring[idx] {
                out[copied] = record;
                copied += 1;
            }
        }
        copied
    }

    #[cfg(feature = "error-history")]
    pub fn clear_history(&mut self) {
        self.ring = [None; ERROR_HISTORY_SIZE];
        self.head = 0;
    }
}
