//! Metric registry.
//!
//! The fixed set of event paths the engine observes, and whether samples for each path are buffered or written
//! through. Adding a monitored metric only requires adding an entry to [`all`].

use std::fmt;

use serde::Serialize;

/// An event path: the ordered name segments under which an event is published on the bus.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct EventPath(Vec<String>);

impl EventPath {
    /// Creates an event path from the given segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Returns the segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns the final segment of this path, if any.
    pub fn last_segment(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for EventPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A monitored metric.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MetricDefinition {
    event_path: EventPath,
    cached: bool,
}

impl MetricDefinition {
    /// Creates a metric whose samples are buffered before being persisted.
    pub fn cached<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_path: EventPath::new(segments),
            cached: true,
        }
    }

    /// Creates a metric whose samples are persisted immediately, one at a time.
    pub fn write_through<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_path: EventPath::new(segments),
            cached: false,
        }
    }

    /// Returns the event path observed for this metric.
    pub fn event_path(&self) -> &EventPath {
        &self.event_path
    }

    /// Returns `true` if samples for this metric are buffered.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

/// Returns every metric monitored by default.
pub fn all() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition::cached(["pipeline", "processor", "message", "stop"]),
        MetricDefinition::cached(["pipeline", "processor", "message", "exception"]),
        MetricDefinition::cached(["pipeline", "batcher", "stop"]),
        MetricDefinition::cached(["pipeline", "batch_processor", "stop"]),
        MetricDefinition::cached(["pipeline", "producer", "demand"]),
        MetricDefinition::write_through(["pipeline", "topology", "init"]),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn event_paths_are_unique() {
        let defs = all();
        let unique = defs.iter().map(|d| d.event_path().clone()).collect::<HashSet<_>>();
        assert_eq!(unique.len(), defs.len());
    }

    #[test]
    fn topology_init_is_written_through() {
        let init = all()
            .into_iter()
            .find(|d| d.event_path().to_string() == "pipeline.topology.init")
            .unwrap();
        assert!(!init.is_cached());
        assert_eq!(init.event_path().last_segment(), Some("init"));
    }
}
