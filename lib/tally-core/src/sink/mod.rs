//! Persistence sinks.
//!
//! A [`Sink`] bulk-persists batches of measurements. The engine calls it from inside its own processing step, so a slow
//! sink stalls ingestion until it returns; wrap slow sinks in [`TimeoutSink`] to bound that.

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

use crate::measurement::MeasurementRecord;

mod blackhole;
pub use self::blackhole::BlackholeSink;

mod jsonl;
pub use self::jsonl::JsonLinesSink;

mod memory;
pub use self::memory::MemorySink;

mod timeout;
pub use self::timeout::TimeoutSink;

/// Operation name used for bulk measurement inserts.
pub const INSERT_MEASUREMENTS: &str = "insert_measurements";

/// Operation name used when resolving a component path to its identifier.
pub const RESOLVE_COMPONENT: &str = "resolve_component";

/// Result of a successful persist call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PersistOutcome {
    /// Number of rows persisted.
    pub inserted: usize,
}

/// A persistence failure.
///
/// Every variant names the operation that failed so the failure can be logged in a structured way.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum SinkError {
    /// A record violated a constraint of the store.
    #[snafu(display("{} rejected '{}': violates constraint '{}'", operation, value, constraint))]
    Rejected {
        /// Failing operation.
        operation: &'static str,

        /// The offending value.
        value: String,

        /// The violated constraint.
        constraint: &'static str,
    },

    /// An I/O error occurred while talking to the store.
    #[snafu(display("I/O error during {}", operation))]
    Io {
        /// Failing operation.
        operation: &'static str,

        /// Error source.
        source: std::io::Error,
    },

    /// The store did not answer in time.
    #[snafu(display("{} timed out after {:?}", operation, elapsed))]
    Timeout {
        /// Failing operation.
        operation: &'static str,

        /// How long the operation was allowed to run.
        elapsed: Duration,
    },

    /// The store is not available.
    #[snafu(display("store unavailable during {}: {}", operation, reason))]
    Unavailable {
        /// Failing operation.
        operation: &'static str,

        /// Why the store is unavailable.
        reason: String,
    },
}

impl SinkError {
    /// Returns the name of the failing operation.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Rejected { operation, .. }
            | Self::Io { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Unavailable { operation, .. } => *operation,
        }
    }

    /// Returns the value that caused the failure, if the failure is attributable to one.
    pub fn failing_value(&self) -> Option<&str> {
        match self {
            Self::Rejected { value, .. } => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Bulk persistence of measurements.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Persists a non-empty, ordered batch of measurements.
    ///
    /// Implementations resolve or create any dimension referenced by the records (such as component path identifiers).
    ///
    /// # Errors
    ///
    /// If the batch could not be persisted, an error describing the failing operation is returned. The caller does not
    /// retry.
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError>;
}

#[async_trait]
impl<S> Sink for std::sync::Arc<S>
where
    S: Sink + ?Sized,
{
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        (**self).persist(batch).await
    }
}
