use std::time::Duration;

use tracing::{Span, field};

use super::TraceId;

/// Root span for a scheduler entry point (one per public API call).
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id.as_str(),
        resource_id = field::Empty,
        token = field::Empty,
    )
}

/// Child span for a sub-step within a root span (inherits its fields).
pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!(
        "child",
        name = %name,
        resource_id = field::Empty,
        token = field::Empty,
    )
}

/// Records domain identifiers onto the current span once they are known,
/// so later log lines in the same transaction carry them.
pub fn annotate_span(resource_id: &str, token: Option<&str>) {
    let span = Span::current();
    span.record("resource_id", field::display(resource_id));
    if let Some(t) = token {
        span.record("token", field::display(t));
    }
}

/// Times `fut` and logs a warning if it exceeds `max`. Used around store
/// calls so a slow query shows up without instrumenting every call site by
/// hand.
pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
