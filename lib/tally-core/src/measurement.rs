//! Measurement records and validation of raw measurements.

use chrono::{DateTime, SubsecRound as _, Utc};
use serde::Serialize;
use serde_json::Value;
use snafu::Snafu;

/// Key holding the component path identifier in a raw measurement.
pub const COMPONENT_PATH_KEY: &str = "component_path";

/// Key holding the metric name in a raw measurement.
pub const METRIC_NAME_KEY: &str = "metric_name";

/// Key holding the integer value in a raw measurement.
pub const VALUE_KEY: &str = "value";

/// Reasons a raw measurement is rejected.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum MalformedMeasurement {
    /// The raw measurement was not a JSON object.
    #[snafu(display("measurement is not an object"))]
    NotAnObject,

    /// A required field was absent.
    #[snafu(display("missing field '{}'", field))]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A required field had the wrong type.
    #[snafu(display("field '{}' must be {}", field, expected))]
    WrongType {
        /// Name of the offending field.
        field: &'static str,

        /// Description of the expected type.
        expected: &'static str,
    },
}

/// A single timestamped sample.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct MeasurementRecord {
    captured_at: DateTime<Utc>,
    component_path: String,
    metric_name: String,
    value: i64,
}

impl MeasurementRecord {
    /// Creates a new record, truncating `captured_at` to microsecond precision.
    pub fn new<P, N>(captured_at: DateTime<Utc>, component_path: P, metric_name: N, value: i64) -> Self
    where
        P: Into<String>,
        N: Into<String>,
    {
        Self {
            captured_at: captured_at.trunc_subsecs(6),
            component_path: component_path.into(),
            metric_name: metric_name.into(),
            value,
        }
    }

    /// Validates a raw measurement and builds a record from it.
    ///
    /// The raw value must be an object with a string `component_path`, a string `metric_name` and an integer `value`.
    /// Additional fields are ignored.
    ///
    /// # Errors
    ///
    /// If the raw value does not have the required shape, an error describing the first problem found is returned.
    pub fn from_raw(raw: &Value, captured_at: DateTime<Utc>) -> Result<Self, MalformedMeasurement> {
        let object = raw.as_object().ok_or(MalformedMeasurement::NotAnObject)?;

        let field = |name: &'static str| object.get(name).ok_or(MalformedMeasurement::MissingField { field: name });

        let component_path = field(COMPONENT_PATH_KEY)?
            .as_str()
            .ok_or(MalformedMeasurement::WrongType {
                field: COMPONENT_PATH_KEY,
                expected: "a string",
            })?;
        let metric_name = field(METRIC_NAME_KEY)?
            .as_str()
            .ok_or(MalformedMeasurement::WrongType {
                field: METRIC_NAME_KEY,
                expected: "a string",
            })?;
        let value = field(VALUE_KEY)?.as_i64().ok_or(MalformedMeasurement::WrongType {
            field: VALUE_KEY,
            expected: "a 64-bit signed integer",
        })?;

        Ok(Self::new(captured_at, component_path, metric_name, value))
    }

    /// Returns when the measurement was received.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Returns the component path identifier.
    pub fn component_path(&self) -> &str {
        &self.component_path
    }

    /// Returns the metric name.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Returns the sampled value.
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// Returns the current time, truncated to microsecond precision.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
