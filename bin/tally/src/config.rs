use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use tally_config::GenericConfiguration;
use tally_error::GenericError;

const DEFAULT_SINK_PATH: &str = "tally-measurements.jsonl";
const DEFAULT_SINK_TIMEOUT_MS: u64 = 10_000;

/// Where flushed batches go.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Append to a JSON-lines file.
    #[default]
    Jsonl,

    /// Discard everything.
    Blackhole,
}

/// Sink configuration.
#[derive(Clone, Debug)]
pub struct SinkConfiguration {
    kind: SinkKind,
    path: PathBuf,
    timeout: Duration,
}

impl SinkConfiguration {
    /// Creates a new `SinkConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If any of the `sink.*` settings are present but invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            kind: config.try_get_typed("sink.kind")?.unwrap_or_default(),
            path: config
                .try_get_typed("sink.path")?
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SINK_PATH)),
            timeout: Duration::from_millis(
                config
                    .try_get_typed("sink.timeout_ms")?
                    .unwrap_or(DEFAULT_SINK_TIMEOUT_MS),
            ),
        })
    }

    /// Returns where flushed batches go.
    pub const fn kind(&self) -> SinkKind {
        self.kind
    }

    /// Returns the path of the JSON-lines file.
    ///
    /// Only used by the `jsonl` sink.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Returns the bound applied to each persist call.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Built-in load generator configuration.
#[derive(Clone, Debug)]
pub struct SyntheticConfiguration {
    /// Events emitted per second. Zero disables the generator.
    events_per_second: u32,
}

impl SyntheticConfiguration {
    /// Creates a new `SyntheticConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If `synthetic.events_per_second` is present but not a non-negative integer, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            events_per_second: config.try_get_typed("synthetic.events_per_second")?.unwrap_or(0),
        })
    }

    /// Returns `true` if the generator should run.
    pub const fn enabled(&self) -> bool {
        self.events_per_second > 0
    }

    /// Returns the number of events to emit per second.
    pub const fn events_per_second(&self) -> u32 {
        self.events_per_second
    }
}
