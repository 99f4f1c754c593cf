use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Initialize metric descriptions (can be called multiple times safely)
///
/// The host process installs the exporter; without one every call below is a no-op.
pub fn init_metric_descriptions() {
    describe_counter!(
        "debug_events_collected_total",
        "Total number of debug events buffered by the collector"
    );
    describe_counter!(
        "debug_buffer_overflow_total",
        "Events dropped because the collector buffer was full"
    );
    describe_counter!(
        "debug_buffer_flushes_total",
        "Collector buffer flushes by trigger"
    );
    describe_gauge!(
        "debug_buffer_utilization",
        "Fraction of the collector buffer in use"
    );
    describe_counter!(
        "debug_records_saved_total",
        "Request records persisted to debug storage"
    );
    describe_counter!(
        "debug_records_dropped_total",
        "Request records discarded before persistence"
    );
    describe_counter!(
        "debug_storage_errors_total",
        "Debug storage operation failures"
    );
    describe_counter!(
        "debug_replays_total",
        "Replay attempts by outcome"
    );
    describe_histogram!(
        "debug_replay_duration_seconds",
        "Replayed pipeline execution time in seconds"
    );
    describe_counter!(
        "debug_validations_total",
        "Pipeline validation passes by result"
    );
    describe_counter!(
        "debug_diagnoses_total",
        "Layer diagnoses by failed layer"
    );
}

pub fn record_event_collected(event_type: &str) {
    counter!("debug_events_collected_total", "type" => event_type.to_string()).increment(1);
}

pub fn record_buffer_overflow(policy: &str) {
    counter!("debug_buffer_overflow_total", "policy" => policy.to_string()).increment(1);
}

pub fn record_flush(trigger: &str, events: usize) {
    counter!("debug_buffer_flushes_total", "trigger" => trigger.to_string()).increment(1);
    tracing::trace!(trigger = trigger, events = events, "Collector flush recorded");
}

pub fn update_buffer_utilization(utilization: f64) {
    gauge!("debug_buffer_utilization").set(utilization);
}

pub fn record_saved(port: u16) {
    counter!("debug_records_saved_total", "port" => port.to_string()).increment(1);
}

pub fn record_dropped(reason: &str) {
    counter!("debug_records_dropped_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_storage_error(operation: &str) {
    counter!("debug_storage_errors_total", "operation" => operation.to_string()).increment(1);
}

pub fn record_replay(outcome: &str, duration: Duration) {
    counter!("debug_replays_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("debug_replay_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_validation(result: &str) {
    counter!("debug_validations_total", "result" => result.to_string()).increment(1);
}

pub fn record_diagnosis(failed_layer: Option<&str>) {
    counter!(
        "debug_diagnoses_total",
        "failed_layer" => failed_layer.unwrap_or("none").to_string(),
    )
    .increment(1);
}
