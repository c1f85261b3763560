use std::time::Duration;

use async_trait::async_trait;

use super::{PersistOutcome, Sink, SinkError, INSERT_MEASUREMENTS};
use crate::measurement::MeasurementRecord;

/// Bounds every persist call of the wrapped sink.
///
/// Calls that take longer than the timeout are abandoned and reported as [`SinkError::Timeout`].
pub struct TimeoutSink<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutSink<S> {
    /// Wraps `inner`, bounding each persist call by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<S> Sink for TimeoutSink<S>
where
    S: Sink,
{
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        match tokio::time::timeout(self.timeout, self.inner.persist(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                operation: INSERT_MEASUREMENTS,
                elapsed: self.timeout,
            }),
        }
    }
}
