use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::info;

use super::{PersistOutcome, Sink, SinkError};
use crate::measurement::MeasurementRecord;

struct Window {
    started: Instant,
    rows: usize,
}

/// A sink that discards everything it receives.
///
/// Useful for exercising the engine without a store, while still periodically reporting how many rows it was handed.
pub struct BlackholeSink {
    report_interval: Duration,
    window: Mutex<Window>,
}

impl BlackholeSink {
    /// Creates a new `BlackholeSink` that reports received rows at most once per `report_interval`.
    pub fn new(report_interval: Duration) -> Self {
        Self {
            report_interval,
            window: Mutex::new(Window {
                started: Instant::now(),
                rows: 0,
            }),
        }
    }
}

impl Default for BlackholeSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        let inserted = batch.len();

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.rows += inserted;
        if window.started.elapsed() >= self.report_interval {
            info!(rows = window.rows, "Discarded measurements.");
            window.started = Instant::now();
            window.rows = 0;
        }

        Ok(PersistOutcome { inserted })
    }
}
