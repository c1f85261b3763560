use std::num::NonZeroUsize;

use crate::measurement::MeasurementRecord;

/// Measurements waiting to be flushed.
///
/// After every push that does not hit the threshold, fewer than `flush_threshold` records are pending. A push that
/// reaches the threshold must be followed by [`take`][Self::take] before the next push.
pub(super) struct BufferState {
    pending: Vec<MeasurementRecord>,
    flush_threshold: usize,
}

impl BufferState {
    pub fn new(flush_threshold: NonZeroUsize) -> Self {
        Self {
            pending: Vec::new(),
            flush_threshold: flush_threshold.get(),
        }
    }

    /// Appends a record, returning `true` if the flush threshold has been reached.
    pub fn push(&mut self, record: MeasurementRecord) -> bool {
        self.pending.push(record);
        self.pending.len() >= self.flush_threshold
    }

    /// Takes every pending record, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<MeasurementRecord> {
        std::mem::take(&mut self.pending)
    }

    /// Discards every pending record, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    pub fn pending(&self) -> &[MeasurementRecord] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
