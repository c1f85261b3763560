use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{PersistOutcome, Sink, SinkError, INSERT_MEASUREMENTS};
use crate::measurement::MeasurementRecord;

#[derive(Default)]
struct State {
    batches: Vec<Vec<MeasurementRecord>>,
    persist_calls: usize,
    failures_remaining: usize,
}

/// A sink that keeps every persisted batch in memory.
///
/// Clones share the same storage. The sink can be told to fail a number of upcoming calls, in which case the batch is
/// counted as a call but not stored.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<State>>,
}

impl MemorySink {
    /// Creates a new, empty `MemorySink`.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` persist calls fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// Returns every successfully persisted batch, in persist order.
    pub fn batches(&self) -> Vec<Vec<MeasurementRecord>> {
        self.lock().batches.clone()
    }

    /// Returns every successfully persisted record, in persist order.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Returns the number of persist calls made, including failed ones.
    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        let mut state = self.lock();
        state.persist_calls += 1;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SinkError::Unavailable {
                operation: INSERT_MEASUREMENTS,
                reason: "memory sink configured to fail".to_string(),
            });
        }

        let inserted = batch.len();
        state.batches.push(batch);
        Ok(PersistOutcome { inserted })
    }
}
