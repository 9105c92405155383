//! Structured logging, tracing spans and metrics.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_dispatch, record_event, record_monitoring_dropped, record_monitoring_pushed,
    record_serving, record_step_failure,
};
pub use spans::{EventSpan, SpanExt};
