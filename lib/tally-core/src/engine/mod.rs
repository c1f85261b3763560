//! The buffering engine.
//!
//! A single task owns the pending measurements and processes one message at a time, to completion. Producers talk to
//! it through a cloneable [`BufferHandle`]: ingestion, flush and reset requests are fire-and-forget, while queries
//! wait for the engine to reach them in its queue and reply. Messages from one producer are processed in the order
//! they were sent.
//!
//! ## Flushing
//!
//! Pending measurements are handed to the [`Sink`] when the flush threshold is reached, when the flush interval
//! elapses, or when explicitly requested. The pending collection is emptied before the sink is called, and a batch the
//! sink fails to persist is logged and dropped: delivery is at-most-once. The sink is awaited inside the engine's
//! processing step, so nothing else is processed while a batch is being persisted.
//!
//! ## Termination
//!
//! When the engine stops, for whatever reason, every bus handler it installed is detached before anything else is
//! released. Measurements still pending at that point are discarded.

use std::{
    num::{NonZeroU64, NonZeroUsize},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt as _, Snafu};
use tally_config::GenericConfiguration;
use tally_error::GenericError;
use tokio::{
    pin, select,
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::{sleep, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bus::{BusError, EventBus},
    dispatcher::Dispatcher,
    measurement::{now_micros, MeasurementRecord},
    registry::MetricDefinition,
    shutdown::{shutdown_pair, ShutdownSignal, ShutdownTrigger},
    sink::Sink,
};

mod state;
use self::state::BufferState;

mod telemetry;
use self::telemetry::Telemetry;

const DEFAULT_FLUSH_THRESHOLD: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(value) => value,
    None => unreachable!(),
};

const DEFAULT_FLUSH_INTERVAL_MS: NonZeroU64 = match NonZeroU64::new(5000) {
    Some(value) => value,
    None => unreachable!(),
};

const fn default_flush_threshold() -> NonZeroUsize {
    DEFAULT_FLUSH_THRESHOLD
}

const fn default_flush_interval_ms() -> NonZeroU64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

/// Errors from starting or talking to the buffering engine.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EngineError {
    /// No metric list was supplied at startup.
    #[snafu(display("A metric list is required to start the buffering engine."))]
    MissingMetrics,

    /// No sink was supplied at startup.
    #[snafu(display("A sink is required to start the buffering engine."))]
    MissingSink,

    /// The same event path was subscribed to twice.
    #[snafu(display("Event path '{}' is already subscribed.", event_path))]
    DuplicateSubscription {
        /// The event path subscribed to twice.
        event_path: String,

        /// Error source.
        source: BusError,
    },

    /// The engine is no longer running.
    #[snafu(display("The buffering engine is not running."))]
    Stopped,

    /// The engine task panicked.
    #[snafu(display("The buffering engine crashed."))]
    Crashed {
        /// Error source.
        source: JoinError,
    },
}

/// Buffering engine configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct BufferConfiguration {
    /// Number of pending measurements that triggers a flush.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_flush_threshold")]
    flush_threshold: NonZeroUsize,

    /// Interval between periodic flushes, in milliseconds.
    ///
    /// Defaults to 5000.
    #[serde(default = "default_flush_interval_ms")]
    flush_interval_ms: NonZeroU64,
}

impl BufferConfiguration {
    /// Creates a new `BufferConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If either setting is present but not a positive integer, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Creates a new `BufferConfiguration` with default values.
    pub fn with_defaults() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }

    /// Sets the number of pending measurements that triggers a flush.
    pub fn with_flush_threshold(mut self, flush_threshold: NonZeroUsize) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    /// Sets the interval between periodic flushes.
    ///
    /// Sub-millisecond precision is discarded, and the interval is at least one millisecond.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        let millis = u64::try_from(flush_interval.as_millis()).unwrap_or(u64::MAX);
        self.flush_interval_ms = NonZeroU64::new(millis).unwrap_or(NonZeroU64::MIN);
        self
    }

    /// Returns the flush threshold.
    pub fn flush_threshold(&self) -> NonZeroUsize {
        self.flush_threshold
    }

    /// Returns the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.get())
    }
}

/// What caused a flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlushTrigger {
    Threshold,
    Timer,
    Explicit,
}

impl FlushTrigger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Timer => "timer",
            Self::Explicit => "explicit",
        }
    }
}

enum Message {
    Ingest {
        raw: Value,
        captured_at: DateTime<Utc>,
        cached: bool,
    },
    Flush,
    Reset,
    GetPending(oneshot::Sender<Vec<MeasurementRecord>>),
    GetRegisteredMetrics(oneshot::Sender<Vec<MetricDefinition>>),
}

/// A handle to a running buffering engine.
///
/// Cheap to clone. Operations on a handle whose engine has stopped are dropped (fire-and-forget operations) or fail
/// with [`EngineError::Stopped`] (queries).
#[derive(Clone)]
pub struct BufferHandle {
    messages_tx: mpsc::UnboundedSender<Message>,
}

impl BufferHandle {
    fn send(&self, message: Message) -> bool {
        if self.messages_tx.send(message).is_err() {
            trace!("Buffering engine is not running. Dropping message.");
            return false;
        }
        true
    }

    /// Submits a raw measurement for buffering, stamped with the current time.
    ///
    /// Does not wait for the measurement to be processed. Malformed measurements are dropped by the engine with a
    /// warning; nothing is reported back to the caller.
    pub fn ingest(&self, raw: Value) {
        self.ingest_received(raw, now_micros(), true);
    }

    pub(crate) fn ingest_received(&self, raw: Value, captured_at: DateTime<Utc>, cached: bool) {
        self.send(Message::Ingest {
            raw,
            captured_at,
            cached,
        });
    }

    /// Requests a flush of whatever is pending when the request is processed.
    pub fn flush(&self) {
        self.send(Message::Flush);
    }

    /// Requests that all pending measurements be discarded without being persisted.
    pub fn reset(&self) {
        self.send(Message::Reset);
    }

    /// Returns the pending measurements.
    ///
    /// Observes the effect of every message previously sent from this caller.
    ///
    /// # Errors
    ///
    /// If the engine is not running, an error is returned.
    pub async fn get_pending(&self) -> Result<Vec<MeasurementRecord>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if !self.send(Message::GetPending(reply_tx)) {
            return Err(EngineError::Stopped);
        }
        reply_rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Returns the metric definitions the engine was started with.
    ///
    /// # Errors
    ///
    /// If the engine is not running, an error is returned.
    pub async fn get_registered_metrics(&self) -> Result<Vec<MetricDefinition>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if !self.send(Message::GetRegisteredMetrics(reply_tx)) {
            return Err(EngineError::Stopped);
        }
        reply_rx.await.map_err(|_| EngineError::Stopped)
    }
}

/// Builder for a buffering engine.
pub struct BufferEngineBuilder {
    config: BufferConfiguration,
    metrics: Option<Vec<MetricDefinition>>,
    bus: Option<EventBus>,
    sink: Option<Arc<dyn Sink>>,
}

impl BufferEngineBuilder {
    /// Sets the metrics to subscribe to. Required.
    pub fn with_metrics(mut self, metrics: Vec<MetricDefinition>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the event bus to subscribe on.
    ///
    /// Defaults to a new, private bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the sink that persists flushed batches. Required.
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: Sink + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Subscribes to the configured metrics and spawns the engine on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the metric list or the sink is missing, or an event path appears twice in the metric list, an error is
    /// returned and nothing is left subscribed.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a Tokio runtime.
    pub fn spawn(self) -> Result<RunningEngine, EngineError> {
        let metrics = self.metrics.ok_or(EngineError::MissingMetrics)?;
        let sink = self.sink.ok_or(EngineError::MissingSink)?;
        let bus = self.bus.unwrap_or_default();

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let handle = BufferHandle { messages_tx };

        // From here on, the guard detaches whatever was attached, whether registration fails or the engine task is
        // dropped before it ever runs.
        let mut teardown = Teardown(Dispatcher::new(bus));
        teardown.0.register_metrics(&metrics, &handle)?;

        info!(
            engine_id = teardown.0.id(),
            metrics = metrics.len(),
            flush_threshold = self.config.flush_threshold.get(),
            flush_interval_ms = self.config.flush_interval_ms.get(),
            "Buffering engine starting."
        );

        let engine = Engine {
            state: BufferState::new(self.config.flush_threshold),
            flush_interval: self.config.flush_interval(),
            registered_metrics: metrics,
            sink,
            telemetry: Telemetry::new(teardown.0.id()),
        };

        let (shutdown_trigger, shutdown) = shutdown_pair();
        let join = tokio::spawn(engine.run(messages_rx, shutdown, teardown));

        Ok(RunningEngine {
            handle,
            shutdown_trigger,
            join,
        })
    }
}

/// Entrypoint for building a buffering engine.
pub struct BufferEngine;

impl BufferEngine {
    /// Creates a builder for an engine with the given configuration.
    pub fn builder(config: BufferConfiguration) -> BufferEngineBuilder {
        BufferEngineBuilder {
            config,
            metrics: None,
            bus: None,
            sink: None,
        }
    }
}

/// A spawned buffering engine.
///
/// Dropping this value stops the engine in the background.
pub struct RunningEngine {
    handle: BufferHandle,
    shutdown_trigger: ShutdownTrigger,
    join: JoinHandle<()>,
}

impl RunningEngine {
    /// Returns a handle for talking to the engine.
    pub fn handle(&self) -> BufferHandle {
        self.handle.clone()
    }

    /// Returns `true` if the engine task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the engine and waits for it to exit.
    ///
    /// Pending measurements are discarded, not flushed.
    ///
    /// # Errors
    ///
    /// If the engine task panicked, an error is returned. Its bus handlers have been detached regardless.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.shutdown_trigger.trigger();
        self.join.await.context(Crashed)
    }
}

/// Detaches the dispatcher's handlers when dropped: on normal exit, during unwinding, and when the engine task is
/// cancelled, even before its first poll.
struct Teardown(Dispatcher);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.unregister_handler();
    }
}

struct Engine {
    state: BufferState,
    flush_interval: Duration,
    registered_metrics: Vec<MetricDefinition>,
    sink: Arc<dyn Sink>,
    telemetry: Telemetry,
}

impl Engine {
    async fn run(
        mut self, mut messages_rx: mpsc::UnboundedReceiver<Message>, mut shutdown: ShutdownSignal,
        teardown: Teardown,
    ) {
        // Re-armed only after it fires, so a slow flush delays the next one rather than stacking them up.
        let flush_timer = sleep(self.flush_interval);
        pin!(flush_timer);

        debug!("Buffering engine started.");

        loop {
            select! {
                biased;

                _ = shutdown.triggered() => {
                    debug!("Buffering engine stopping...");
                    break;
                },
                _ = &mut flush_timer => {
                    trace!("Flush timer fired.");
                    self.flush(FlushTrigger::Timer).await;
                    flush_timer.as_mut().reset(Instant::now() + self.flush_interval);
                },
                maybe_message = messages_rx.recv() => match maybe_message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("All buffer handles dropped. Buffering engine stopping...");
                        break;
                    }
                },
            }
        }

        drop(teardown);

        let discarded = self.state.clear();
        self.telemetry.rows_discarded().increment(discarded as u64);
        self.telemetry.pending_measurements().set(0.0);
        debug!(discarded, "Buffering engine stopped.");
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Ingest {
                raw,
                captured_at,
                cached,
            } => self.ingest(raw, captured_at, cached).await,
            Message::Flush => self.flush(FlushTrigger::Explicit).await,
            Message::Reset => {
                let discarded = self.state.clear();
                self.telemetry.rows_discarded().increment(discarded as u64);
                self.telemetry.pending_measurements().set(0.0);
                debug!(discarded, "Discarded pending measurements.");
            }
            Message::GetPending(reply_tx) => {
                let _ = reply_tx.send(self.state.pending().to_vec());
            }
            Message::GetRegisteredMetrics(reply_tx) => {
                let _ = reply_tx.send(self.registered_metrics.clone());
            }
        }
    }

    async fn ingest(&mut self, raw: Value, captured_at: DateTime<Utc>, cached: bool) {
        let record = match MeasurementRecord::from_raw(&raw, captured_at) {
            Ok(record) => record,
            Err(e) => {
                self.telemetry.measurements_malformed().increment(1);
                warn!(reason = %e, measurement = %raw, "Dropping malformed measurement.");
                return;
            }
        };

        self.telemetry.measurements_ingested().increment(1);

        if !cached {
            self.persist(vec![record]).await;
            return;
        }

        if self.state.push(record) {
            self.flush(FlushTrigger::Threshold).await;
        } else {
            self.telemetry.pending_measurements().set(self.state.len() as f64);
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        // The batch leaves the buffer before the sink sees it, whatever the sink then does with it.
        let batch = self.state.take();
        self.telemetry.pending_measurements().set(0.0);

        if batch.is_empty() {
            trace!(trigger = trigger.as_str(), "Nothing to flush.");
            return;
        }

        self.telemetry.flushes(trigger).increment(1);
        debug!(trigger = trigger.as_str(), batch_size = batch.len(), "Flushing measurements...");
        self.persist(batch).await;
    }

    async fn persist(&mut self, batch: Vec<MeasurementRecord>) {
        let batch_size = batch.len();

        match self.sink.persist(batch).await {
            Ok(outcome) => {
                self.telemetry.rows_persisted().increment(outcome.inserted as u64);
                debug!(inserted = outcome.inserted, "Flushed measurement batch.");
            }
            Err(e) => {
                self.telemetry.batches_failed().increment(1);
                self.telemetry.rows_discarded().increment(batch_size as u64);
                error!(
                    operation = e.operation(),
                    value = e.failing_value().unwrap_or("-"),
                    batch_size,
                    pending_after = self.state.len(),
                    error = %e,
                    "Failed to persist measurement batch; batch discarded."
                );
            }
        }
    }
}
