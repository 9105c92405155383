//! Telemetry module tests.

use std::path::PathBuf;
use std::time::Duration;

use flowserve::dispatch::DispatchError;
use flowserve::models::ExecutionMechanism;
use flowserve::telemetry::{
    init_logging, init_metrics, record_dispatch, record_event, record_monitoring_dropped, record_monitoring_pushed,
    record_serving, record_step_failure, EventSpan, LogConfig, LogError, LogFormat, SpanExt,
};
use tracing::Span;

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_json_on_stderr() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_format_parses_and_displays() {
    assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert_eq!("Text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert_eq!(LogFormat::Json.to_string(), "json");
    assert!(matches!("yaml".parse::<LogFormat>(), Err(LogError::InvalidFormat(_))));
}

#[test]
fn init_logging_rejects_bad_filter() {
    let config = LogConfig {
        format: LogFormat::Json,
        level: "flowserve=verbose".to_string(),
        output_path: None,
    };
    assert!(matches!(init_logging(&config), Err(LogError::InvalidFilter(_))));
}

#[test]
fn init_logging_reports_unwritable_file() {
    let config = LogConfig {
        output_path: Some(PathBuf::from("/nonexistent/dir/flowserve.log")),
        ..LogConfig::default()
    };
    assert!(matches!(init_logging(&config), Err(LogError::FileOpen(_))));
}

#[test]
fn log_error_display() {
    let error = LogError::FileOpen("permission denied".to_string());
    assert!(error.to_string().contains("Failed to open log file"));
    assert!(LogError::AlreadyInitialized.to_string().contains("already initialized"));
}

// =============================================================================
// Span Tests
// =============================================================================

#[test]
fn span_ext_records_both_outcomes() {
    let span = Span::none();
    span.record_result(&Ok::<_, &str>(1));
    span.record_result(&Err::<i32, _>("boom"));
}

#[test]
fn event_and_step_spans_nest() {
    let event = EventSpan::new("evt-1", "/v2/models/m1/infer");
    let _outer = event.enter();
    let step = EventSpan::step("evt-1", "router");
    let _inner = step.enter();
    step.record_result(&Ok::<_, String>(()));
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[test]
fn metrics_without_recorder_are_noops() {
    init_metrics();
    init_metrics();

    let ok: Result<(), DispatchError> = Ok(());
    let failed: Result<(), DispatchError> = Err(DispatchError::Timeout {
        model: "m1".into(),
        timeout: Duration::from_millis(10),
    });
    for mechanism in ExecutionMechanism::ALL {
        record_dispatch("m1", mechanism, &ok, Duration::from_millis(1));
        record_dispatch("m1", mechanism, &failed, Duration::from_millis(10));
    }
    record_serving("m1", "infer", true, Duration::ZERO);
    record_serving("m1", "explain", false, Duration::from_secs(1));
    record_monitoring_pushed("m1");
    record_monitoring_dropped("m1");
    record_step_failure("router");
    record_event(true);
    record_event(false);
}
