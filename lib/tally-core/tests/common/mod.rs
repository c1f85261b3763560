#![allow(dead_code)]

use std::{
    collections::HashMap,
    fmt,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{json, Value};
use tally_core::{bus::BusEvent, engine::BufferConfiguration, registry::EventPath};
use tracing::{
    field::{Field, Visit},
    subscriber::DefaultGuard,
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, layer::SubscriberExt as _, Layer};

/// A log event captured during a test.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

/// Collects every log event emitted on the current thread while installed.
#[derive(Clone, Default)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    /// Installs a capturing subscriber as the default for the current thread.
    pub fn install() -> (Self, DefaultGuard) {
        let captured = Self::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (captured, guard)
    }

    pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message == message)
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: collector.message,
            fields: collector.fields,
        });
    }
}

pub fn config(flush_threshold: usize, flush_interval: Duration) -> BufferConfiguration {
    BufferConfiguration::with_defaults()
        .with_flush_threshold(NonZeroUsize::new(flush_threshold).unwrap())
        .with_flush_interval(flush_interval)
}

pub fn raw(component_path: &str, value: i64) -> Value {
    json!({
        "component_path": component_path,
        "metric_name": "duration",
        "value": value,
    })
}

pub fn message_stop() -> EventPath {
    EventPath::new(["pipeline", "processor", "message", "stop"])
}

pub fn topology_init() -> EventPath {
    EventPath::new(["pipeline", "topology", "init"])
}

pub fn bus_event(component_path: &str, duration: i64) -> BusEvent {
    BusEvent::default()
        .with_metadata("name", component_path)
        .with_measurement("duration", duration)
}
