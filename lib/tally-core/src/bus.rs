//! An in-process event bus.
//!
//! Instrumented code publishes [`BusEvent`]s under an [`EventPath`]. Handlers attached to that exact path are invoked
//! synchronously, on the publisher's own thread, so handlers must do as little as possible: the dispatcher's handler
//! only normalizes the event and hands it off over a channel.
//!
//! Buses are plain values rather than a process-wide singleton: each clone refers to the same set of handlers, and
//! independent buses never see each other's events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use snafu::Snafu;

use crate::registry::EventPath;

/// Errors that can occur when attaching a handler.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum BusError {
    /// A handler with the same identifier is already attached.
    #[snafu(display("handler '{}' is already attached", handler_id))]
    AlreadyAttached {
        /// The conflicting handler identifier.
        handler_id: String,
    },
}

/// A loosely-typed event as published by instrumentation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BusEvent {
    /// Numeric measurements carried by the event.
    pub measurements: Map<String, Value>,

    /// Descriptive metadata carried by the event.
    pub metadata: Map<String, Value>,
}

impl BusEvent {
    /// Adds a measurement to the event.
    pub fn with_measurement<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.measurements.insert(key.into(), value.into());
        self
    }

    /// Adds a metadata entry to the event.
    pub fn with_metadata<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

type Handler = Arc<dyn Fn(&EventPath, &BusEvent) + Send + Sync>;

struct AttachedHandler {
    event_path: EventPath,
    handler: Handler,
}

/// A handle to an event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<IndexMap<String, AttachedHandler>>>,
}

impl EventBus {
    /// Creates a new, empty event bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, AttachedHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `handler` to `event_path` under the given identifier.
    ///
    /// # Errors
    ///
    /// If a handler with the same identifier is already attached, an error is returned and the existing handler is left
    /// in place.
    pub fn attach<F>(&self, handler_id: impl Into<String>, event_path: EventPath, handler: F) -> Result<(), BusError>
    where
        F: Fn(&EventPath, &BusEvent) + Send + Sync + 'static,
    {
        let handler_id = handler_id.into();
        let mut handlers = self.lock();
        if handlers.contains_key(&handler_id) {
            return Err(BusError::AlreadyAttached { handler_id });
        }

        handlers.insert(
            handler_id,
            AttachedHandler {
                event_path,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Detaches the handler with the given identifier.
    ///
    /// Returns `true` if a handler was attached.
    pub fn detach(&self, handler_id: &str) -> bool {
        self.lock().shift_remove(handler_id).is_some()
    }

    /// Publishes an event, invoking every handler attached to `event_path` on the calling thread.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event_path: &EventPath, event: &BusEvent) -> usize {
        // Handlers run without the lock held so they're free to use the bus themselves.
        let matching = self
            .lock()
            .values()
            .filter(|attached| &attached.event_path == event_path)
            .map(|attached| Arc::clone(&attached.handler))
            .collect::<Vec<_>>();

        for handler in &matching {
            handler(event_path, event);
        }

        matching.len()
    }

    /// Returns `true` if a handler with the given identifier is attached.
    pub fn is_attached(&self, handler_id: &str) -> bool {
        self.lock().contains_key(handler_id)
    }

    /// Returns the number of attached handlers.
    pub fn handler_count(&self) -> usize {
        self.lock().len()
    }
}
