//! Prometheus metrics for TinyHCI observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("hci_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a coordinator event after decoding.
pub fn event_reduced(kind: &'static str) {
    counter!("hci_events_total", "kind" => kind).increment(1);
}

/// Record a run state transition.
pub fn run_status_changed(target: &str, status: &str) {
    counter!(
        "hci_runs_total",
        "target" => target.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the outcome of a whole build.
pub fn build_finished(status: &str) {
    counter!("hci_builds_total", "status" => status.to_string()).increment(1);
}

/// Record how long a board step took.
pub fn board_step_duration(step: &'static str, target: &str, duration_ms: u64) {
    histogram!("hci_board_step_duration_ms", "step" => step, "target" => target.to_string())
        .record(duration_ms as f64);
}

/// Record toolchain install duration.
pub fn artifact_build_duration(duration_ms: u64) {
    histogram!("hci_artifact_build_duration_ms").record(duration_ms as f64);
}

/// Set the number of builds waiting in the processing queue.
pub fn queue_depth(depth: usize) {
    gauge!("hci_queue_depth").set(depth as f64);
}

/// Set the number of builds held in the index.
pub fn indexed_builds(count: usize) {
    gauge!("hci_indexed_builds").set(count as f64);
}
