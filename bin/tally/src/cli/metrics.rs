use tally_core::registry;

/// Entrypoint for the `metrics` command.
pub fn handle_metrics_command() {
    let metrics = registry::all();
    let width = metrics
        .iter()
        .map(|metric| metric.event_path().to_string().len())
        .max()
        .unwrap_or(0)
        .max("EVENT PATH".len());

    println!("{:<width$}  MODE", "EVENT PATH");
    for metric in metrics {
        let mode = if metric.is_cached() { "buffered" } else { "write-through" };
        println!("{:<width$}  {}", metric.event_path().to_string(), mode);
    }
}
