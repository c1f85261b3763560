use std::sync::Arc;

use tally_config::GenericConfiguration;
use tally_core::{
    bus::EventBus,
    engine::{BufferConfiguration, BufferEngine},
    registry,
    shutdown::shutdown_pair,
    sink::{BlackholeSink, JsonLinesSink, Sink, TimeoutSink},
};
use tally_error::{ErrorContext as _, GenericError};
use tokio::signal::ctrl_c;
use tracing::{info, warn};

use crate::{
    config::{SinkConfiguration, SinkKind, SyntheticConfiguration},
    synthetic::SyntheticSource,
};

/// Entrypoint for the `run` command.
pub async fn handle_run_command(config: GenericConfiguration) -> Result<(), GenericError> {
    info!(process_id = std::process::id(), "Tally starting...");

    let buffer_config =
        BufferConfiguration::from_configuration(&config).error_context("Failed to load buffer configuration.")?;
    let sink_config =
        SinkConfiguration::from_configuration(&config).error_context("Failed to load sink configuration.")?;
    let synthetic_config =
        SyntheticConfiguration::from_configuration(&config).error_context("Failed to load synthetic configuration.")?;

    let bus = EventBus::new();
    let engine = BufferEngine::builder(buffer_config)
        .with_metrics(registry::all())
        .with_event_bus(bus.clone())
        .with_sink(TimeoutSink::new(build_sink(&sink_config), sink_config.timeout()))
        .spawn()
        .error_context("Failed to start buffering engine.")?;

    let synthetic = synthetic_config.enabled().then(|| {
        let (trigger, shutdown) = shutdown_pair();
        let source = SyntheticSource::new(bus.clone(), registry::all(), synthetic_config.events_per_second());
        (tokio::spawn(source.run(shutdown)), trigger)
    });

    info!("Tally started. Press Ctrl-C to stop.");

    if let Err(e) = ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C. Stopping.");
    }

    info!("Received shutdown signal. Stopping...");

    if let Some((task, trigger)) = synthetic {
        trigger.trigger();
        if let Err(e) = task.await {
            warn!(error = %e, "Synthetic source did not stop cleanly.");
        }
    }

    engine.shutdown().await.error_context("Buffering engine did not stop cleanly.")
}

fn build_sink(config: &SinkConfiguration) -> Arc<dyn Sink> {
    match config.kind() {
        SinkKind::Jsonl => {
            info!(path = %config.path().display(), "Persisting measurements to JSON-lines file.");
            Arc::new(JsonLinesSink::new(config.path().clone()))
        }
        SinkKind::Blackhole => {
            info!("Discarding all measurements.");
            Arc::new(BlackholeSink::default())
        }
    }
}
