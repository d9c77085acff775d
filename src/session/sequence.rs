//! Dispatch sequence tracking for sequenced connections.

use super::error::SessionError;

/// Tracks the highest applied dispatch sequence number.
///
/// Each accepted dispatch must carry exactly `last_seq + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last_seq: u64,
}

impl SequenceTracker {
    pub fn new(last_seq: u64) -> Self {
        Self { last_seq }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Accepts `seq` if it is the immediate successor, advancing the tracker.
    /// On any gap, repeat or missing value the tracker is left untouched.
    /// Nothing follows `u64::MAX`, so an exhausted tracker rejects every value.
    pub fn advance(&mut self, seq: Option<u64>) -> Result<u64, SessionError> {
        match (self.last_seq.checked_add(1), seq) {
            (Some(expected), Some(seq)) if seq == expected => {
                self.last_seq = seq;
                Ok(seq)
            }
            (_, got) => Err(SessionError::InvalidSequence {
                expected: self.last_seq.saturating_add(1),
                got,
            }),
        }
    }
}
