//! Built-in load generator.

use std::time::Duration;

use tally_core::{bus::BusEvent, bus::EventBus, registry::MetricDefinition, shutdown::ShutdownSignal};
use tokio::{select, time::interval};
use tracing::{debug, info};

const COMPONENTS: &[&str] = &["orders.processor.default.1", "orders.processor.default.2", "payments.batcher.1"];

/// Emits events on the bus for every registered event path at a fixed rate.
pub struct SyntheticSource {
    bus: EventBus,
    metrics: Vec<MetricDefinition>,
    period: Duration,
}

impl SyntheticSource {
    /// Creates a source emitting `events_per_second` events, spread across `metrics`.
    pub fn new(bus: EventBus, metrics: Vec<MetricDefinition>, events_per_second: u32) -> Self {
        let period = Duration::from_secs(1) / events_per_second.max(1);
        Self { bus, metrics, period }
    }

    /// Runs until `shutdown` resolves.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        if self.metrics.is_empty() {
            return;
        }

        let mut ticker = interval(self.period);
        let mut emitted: u64 = 0;

        info!(period_us = self.period.as_micros() as u64, "Synthetic source started.");

        loop {
            select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let index = emitted as usize;
                    let metric = &self.metrics[index % self.metrics.len()];
                    let event = BusEvent::default()
                        .with_metadata("name", COMPONENTS[index % COMPONENTS.len()])
                        .with_measurement("duration", (emitted % 1000) as i64 * 17 + 100);

                    self.bus.emit(metric.event_path(), &event);
                    emitted += 1;
                },
            }
        }

        debug!(emitted, "Synthetic source stopped.");
    }
}
