//! Event dispatcher.
//!
//! Bridges the multi-producer [`EventBus`] and the single-consumer buffering engine: one handler is attached per
//! registered event path, and each invocation normalizes the event into a raw measurement and hands it to the engine
//! without waiting for it to be processed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    bus::{BusEvent, EventBus},
    engine::{BufferHandle, EngineError},
    measurement::{now_micros, COMPONENT_PATH_KEY, METRIC_NAME_KEY, VALUE_KEY},
    registry::{EventPath, MetricDefinition},
};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

const COMPONENT_PATH_SOURCES: &[&str] = &[COMPONENT_PATH_KEY, "name"];
const METRIC_NAME_SOURCES: &[&str] = &[METRIC_NAME_KEY, "method"];
const VALUE_SOURCES: &[&str] = &[VALUE_KEY, "duration"];

/// Subscribes a buffering engine to the event bus.
pub struct Dispatcher {
    id: String,
    bus: EventBus,
    attached: Vec<String>,
}

impl Dispatcher {
    /// Creates a new `Dispatcher` for the given bus with a process-unique identifier.
    pub fn new(bus: EventBus) -> Self {
        let id = format!("tally-buffer-{}", NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            id,
            bus,
            attached: Vec::new(),
        }
    }

    /// Returns the identifier of this dispatcher.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attaches one handler per metric definition, forwarding every matching event to `engine`.
    ///
    /// Measurements are stamped with the time the event was received, and tagged with the definition's `cached` flag.
    ///
    /// # Errors
    ///
    /// If a handler for the same event path is already attached by this dispatcher, an error is returned. Handlers
    /// attached before the failure stay attached; callers abort startup and call
    /// [`unregister_handler`][Self::unregister_handler].
    pub fn register_metrics(&mut self, defs: &[MetricDefinition], engine: &BufferHandle) -> Result<(), EngineError> {
        for def in defs {
            let handler_id = format!("{}:{}", self.id, def.event_path());
            let engine = engine.clone();
            let cached = def.is_cached();

            self.bus
                .attach(handler_id.clone(), def.event_path().clone(), move |event_path, event| {
                    let captured_at = now_micros();
                    engine.ingest_received(coerce(event_path, event), captured_at, cached);
                })
                .map_err(|source| EngineError::DuplicateSubscription {
                    event_path: def.event_path().to_string(),
                    source,
                })?;

            debug!(handler_id = %handler_id, cached, "Attached measurement handler.");
            self.attached.push(handler_id);
        }

        Ok(())
    }

    /// Detaches every handler attached by this dispatcher.
    ///
    /// Safe to call repeatedly, and before registration has happened.
    pub fn unregister_handler(&mut self) {
        for handler_id in self.attached.drain(..) {
            self.bus.detach(&handler_id);
        }
    }
}

fn first_of<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

/// Coerces a bus event into the raw measurement shape expected by the engine.
///
/// Fields that cannot be found are left out; the engine decides whether what remains is valid.
fn coerce(event_path: &EventPath, event: &BusEvent) -> Value {
    let mut raw = Map::new();

    if let Some(component_path) = first_of(&event.metadata, COMPONENT_PATH_SOURCES) {
        raw.insert(COMPONENT_PATH_KEY.to_string(), component_path.clone());
    }

    let metric_name = first_of(&event.metadata, METRIC_NAME_SOURCES)
        .cloned()
        .or_else(|| event_path.last_segment().map(Value::from));
    if let Some(metric_name) = metric_name {
        raw.insert(METRIC_NAME_KEY.to_string(), metric_name);
    }

    if let Some(value) = first_of(&event.measurements, VALUE_SOURCES) {
        raw.insert(VALUE_KEY.to_string(), value.clone());
    }

    Value::Object(raw)
}
