use std::{
    borrow::Cow,
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt as _,
    sync::Mutex,
};
use tracing::debug;

use super::{Io, PersistOutcome, Sink, SinkError, INSERT_MEASUREMENTS, RESOLVE_COMPONENT};
use crate::measurement::MeasurementRecord;

const COMPONENT_PATH_CONSTRAINT: &str = "components_path_key";

#[derive(Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Component {
        id: u64,
        #[serde(borrow)]
        path: Cow<'a, str>,
    },
    Measurement {
        captured_at: DateTime<Utc>,
        component_id: u64,
        #[serde(borrow)]
        metric_name: Cow<'a, str>,
        value: i64,
    },
}

#[derive(Default)]
struct Store {
    file: Option<File>,
    components: HashMap<String, u64>,
    paths: HashMap<u64, String>,
}

impl Store {
    fn next_component_id(&self) -> u64 {
        self.paths.keys().max().map_or(1, |id| id + 1)
    }

    fn insert_component(&mut self, path: String, id: u64) {
        self.paths.insert(id, path.clone());
        self.components.insert(path, id);
    }

    /// Rebuilds the component dimension from an existing file.
    ///
    /// Each component path maps to exactly one identifier and vice versa. A file that breaks this is rejected rather
    /// than appended to.
    fn index_existing(&mut self, contents: &str) -> Result<(), SinkError> {
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Line<'_>>(line) {
                Ok(Line::Component { id, path }) => {
                    let known_id = self.components.get(&*path).copied();
                    let same_path = self.paths.get(&id).map(|known| known.as_str() == &*path);
                    match (known_id, same_path) {
                        (None, None) => self.insert_component(path.into_owned(), id),
                        (Some(known_id), Some(true)) if known_id == id => {}
                        _ => {
                            return Err(SinkError::Rejected {
                                operation: RESOLVE_COMPONENT,
                                value: format!("{}#{}", path, id),
                                constraint: COMPONENT_PATH_CONSTRAINT,
                            })
                        }
                    }
                }
                Ok(Line::Measurement { .. }) => {}
                Err(e) => debug!(error = %e, "Skipping unreadable line in measurement store."),
            }
        }

        Ok(())
    }
}

/// A measurement store backed by a JSON-lines file.
///
/// Component paths are deduplicated into stable integer identifiers: the first time a path is seen, a `component` line
/// assigning it the next identifier is written, and measurements refer to components by identifier. Measurements
/// themselves are append-only; two samples for the same component and metric may share a timestamp.
///
/// The file is opened lazily on the first persist call, at which point the component dimension is rebuilt from any
/// existing contents so that identifiers survive restarts.
pub struct JsonLinesSink {
    path: PathBuf,
    store: Mutex<Store>,
}

impl JsonLinesSink {
    /// Creates a new `JsonLinesSink` writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: Mutex::new(Store::default()),
        }
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self, store: &mut Store) -> Result<(), SinkError> {
        let mut indexed = Store::default();
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => indexed.index_existing(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(Io {
                    operation: RESOLVE_COMPONENT,
                })
            }
        }

        indexed.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .context(Io {
                    operation: INSERT_MEASUREMENTS,
                })?,
        );
        *store = indexed;
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn persist(&self, batch: Vec<MeasurementRecord>) -> Result<PersistOutcome, SinkError> {
        let mut store = self.store.lock().await;
        if store.file.is_none() {
            self.open(&mut store).await?;
        }

        // New components are only committed once the whole batch has been written.
        let mut new_components = Vec::new();
        let mut next_id = store.next_component_id();
        let mut buf = Vec::new();

        for record in &batch {
            let path = record.component_path();
            let known = store.components.get(path).copied().or_else(|| {
                new_components
                    .iter()
                    .find(|(staged, _)| staged == path)
                    .map(|(_, id)| *id)
            });
            let component_id = match known {
                Some(id) => id,
                None => {
                    let id = next_id;
                    next_id += 1;
                    write_line(
                        &mut buf,
                        &Line::Component {
                            id,
                            path: Cow::Borrowed(path),
                        },
                    )?;
                    new_components.push((path.to_string(), id));
                    id
                }
            };

            write_line(
                &mut buf,
                &Line::Measurement {
                    captured_at: record.captured_at(),
                    component_id,
                    metric_name: Cow::Borrowed(record.metric_name()),
                    value: record.value(),
                },
            )?;
        }

        if let Some(file) = store.file.as_mut() {
            file.write_all(&buf).await.context(Io {
                operation: INSERT_MEASUREMENTS,
            })?;
            file.flush().await.context(Io {
                operation: INSERT_MEASUREMENTS,
            })?;
        }

        for (path, id) in new_components {
            store.insert_component(path, id);
        }

        Ok(PersistOutcome { inserted: batch.len() })
    }
}

fn write_line(buf: &mut Vec<u8>, line: &Line<'_>) -> Result<(), SinkError> {
    serde_json::to_writer(&mut *buf, line)
        .map_err(std::io::Error::from)
        .context(Io {
            operation: INSERT_MEASUREMENTS,
        })?;
    buf.push(b'\n');
    Ok(())
}
