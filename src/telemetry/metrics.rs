//! Metric recording through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a recorder.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use crate::dispatch::DispatchError;
use crate::models::ExecutionMechanism;

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!("flowserve_dispatch_total", "Model dispatches by outcome");
    describe_histogram!(
        "flowserve_dispatch_duration_seconds",
        Unit::Seconds,
        "Model dispatch latency"
    );
    describe_counter!("flowserve_monitoring_records_pushed_total", "Monitoring records written to the stream");
    describe_counter!("flowserve_monitoring_records_dropped_total", "Monitoring records lost");
    describe_counter!("flowserve_step_failures_total", "Unhandled graph step failures");
    describe_counter!("flowserve_events_total", "Events processed by graph servers");
    describe_histogram!(
        "flowserve_serving_duration_seconds",
        Unit::Seconds,
        "Model-serving operation latency"
    );
}

pub fn record_dispatch<T>(
    model: &str,
    mechanism: ExecutionMechanism,
    result: &Result<T, DispatchError>,
    elapsed: Duration,
) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    counter!(
        "flowserve_dispatch_total",
        "model" => model.to_string(),
        "mechanism" => mechanism.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "flowserve_dispatch_duration_seconds",
        "model" => model.to_string(),
        "mechanism" => mechanism.as_str()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_monitoring_pushed(model: &str) {
    counter!("flowserve_monitoring_records_pushed_total", "model" => model.to_string()).increment(1);
}

pub fn record_monitoring_dropped(model: &str) {
    counter!("flowserve_monitoring_records_dropped_total", "model" => model.to_string()).increment(1);
}

pub fn record_step_failure(step: &str) {
    counter!("flowserve_step_failures_total", "step" => step.to_string()).increment(1);
}

pub fn record_event(ok: bool) {
    counter!("flowserve_events_total", "status" => if ok { "ok" } else { "error" }).increment(1);
}

pub fn record_serving(model: &str, op: &str, ok: bool, elapsed: Duration) {
    histogram!(
        "flowserve_serving_duration_seconds",
        "model" => model.to_string(),
        "op" => op.to_string(),
        "status" => if ok { "ok" } else { "error" }
    )
    .record(elapsed.as_secs_f64());
}
