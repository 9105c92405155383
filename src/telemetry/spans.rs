//! Span utilities and extension traits.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-event spans.
pub struct EventSpan;

impl EventSpan {
    /// Span covering one graph traversal.
    ///
    /// `status` and `error.message` are filled by [`SpanExt::record_result`].
    pub fn new(event_id: &str, path: &str) -> Span {
        info_span!(
            "event",
            event_id = %event_id,
            path = %path,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }

    /// Span covering one step of a traversal.
    pub fn step(event_id: &str, step: &str) -> Span {
        info_span!(
            "step",
            event_id = %event_id,
            step = %step,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
