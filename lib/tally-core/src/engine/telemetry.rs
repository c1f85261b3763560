use metrics::{counter, gauge, Counter, Gauge};

use super::FlushTrigger;

/// Internal metrics for a single engine.
#[derive(Clone)]
pub(super) struct Telemetry {
    measurements_ingested: Counter,
    measurements_malformed: Counter,
    flushes_threshold: Counter,
    flushes_timer: Counter,
    flushes_explicit: Counter,
    rows_persisted: Counter,
    batches_failed: Counter,
    rows_discarded: Counter,
    pending_measurements: Gauge,
}

impl Telemetry {
    pub fn new(engine_id: &str) -> Self {
        let engine = engine_id.to_string();
        Self {
            measurements_ingested: counter!("tally_measurements_ingested_total", "engine" => engine.clone()),
            measurements_malformed: counter!(
                "tally_measurements_dropped_total",
                "engine" => engine.clone(),
                "reason" => "malformed"
            ),
            flushes_threshold: counter!("tally_flushes_total", "engine" => engine.clone(), "trigger" => "threshold"),
            flushes_timer: counter!("tally_flushes_total", "engine" => engine.clone(), "trigger" => "timer"),
            flushes_explicit: counter!("tally_flushes_total", "engine" => engine.clone(), "trigger" => "explicit"),
            rows_persisted: counter!("tally_rows_persisted_total", "engine" => engine.clone()),
            batches_failed: counter!("tally_batches_failed_total", "engine" => engine.clone()),
            rows_discarded: counter!("tally_rows_discarded_total", "engine" => engine.clone()),
            pending_measurements: gauge!("tally_pending_measurements", "engine" => engine),
        }
    }

    pub fn measurements_ingested(&self) -> &Counter {
        &self.measurements_ingested
    }

    pub fn measurements_malformed(&self) -> &Counter {
        &self.measurements_malformed
    }

    pub fn flushes(&self, trigger: FlushTrigger) -> &Counter {
        match trigger {
            FlushTrigger::Threshold => &self.flushes_threshold,
            FlushTrigger::Timer => &self.flushes_timer,
            FlushTrigger::Explicit => &self.flushes_explicit,
        }
    }

    pub fn rows_persisted(&self) -> &Counter {
        &self.rows_persisted
    }

    pub fn batches_failed(&self) -> &Counter {
        &self.batches_failed
    }

    pub fn rows_discarded(&self) -> &Counter {
        &self.rows_discarded
    }

    pub fn pending_measurements(&self) -> &Gauge {
        &self.pending_measurements
    }
}
