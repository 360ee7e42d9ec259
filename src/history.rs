//! Bounded time-series history of scored readings

use std::collections::VecDeque;
use std::sync::Arc;

use crate::reading::ScoredReading;

/// Default number of readings kept per patient
pub const DEFAULT_HISTORY_CAPACITY: usize = 120;

/// FIFO ring buffer of the most recent readings
///
/// Readings are kept in the order `push` was called. Timestamps are neither
/// validated nor re-sorted.
#[derive(Debug, Clone)]
pub struct TelemetryHistoryBuffer {
    readings: VecDeque<ScoredReading>,
    capacity: usize,
}

impl TelemetryHistoryBuffer {
    /// Create an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, evicting the oldest when full
    pub fn push(&mut self, reading: ScoredReading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }

        self.readings.push_back(reading);
    }

    /// Ordered copy of the current contents, oldest first
    pub fn snapshot(&self) -> Arc<[ScoredReading]> {
        self.readings.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&ScoredReading> {
        self.readings.back()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TelemetryHistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
