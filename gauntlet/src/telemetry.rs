//! Tracing instrumentation for gauntlet.
//!
//! Helper functions for creating tracing spans and recording step
//! lifecycle events. Spans carry the stage, step, and flavor fields so
//! a single `RUST_LOG=gauntlet=debug` run is enough to reconstruct the
//! schedule.

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span covering one attempt of a step's command.
#[must_use]
pub fn step_dispatch_span(
    stage: impl AsRef<str>,
    step: impl AsRef<str>,
    flavor: impl AsRef<str>,
    attempt: u16,
) -> Span {
    info_span!(
        "gauntlet.dispatch",
        stage = %stage.as_ref(),
        step = %step.as_ref(),
        flavor = %flavor.as_ref(),
        attempt = attempt,
    )
}

/// Span covering the wait for a flavor capacity lease.
#[must_use]
pub fn lease_acquire_span(step: impl AsRef<str>, flavor: impl AsRef<str>) -> Span {
    info_span!(
        "gauntlet.lease",
        step = %step.as_ref(),
        flavor = %flavor.as_ref(),
    )
}

/// Span covering one stage of the run.
#[must_use]
pub fn stage_span(stage: impl AsRef<str>) -> Span {
    info_span!("gauntlet.stage", stage = %stage.as_ref())
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    stage: impl AsRef<str>,
    step: impl AsRef<str>,
    flavor: impl AsRef<str>,
    attempt: u16,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = step_dispatch_span(stage, step, flavor, attempt);
    future.instrument(span)
}

/// Record a finalized step in the log stream.
pub fn record_step_finished(
    stage: impl AsRef<str>,
    step: impl AsRef<str>,
    status: impl AsRef<str>,
    attempts: u16,
    duration_secs: f64,
) {
    tracing::info!(
        stage = %stage.as_ref(),
        step = %step.as_ref(),
        status = %status.as_ref(),
        attempts = attempts,
        duration_secs = duration_secs,
        "step finished"
    );
}

/// Record a finalized stage in the log stream.
pub fn record_stage_finished(stage: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        stage = %stage.as_ref(),
        status = %status.as_ref(),
        "stage finished"
    );
}

/// Record the overall run verdict.
pub fn record_run_finished(status: impl AsRef<str>, duration_secs: f64) {
    tracing::info!(
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "run finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spans are disabled (and carry no metadata) unless a subscriber
    /// is installed, so each span test runs under a default subscriber.
    fn subscriber_guard() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_test_writer().finish(),
        )
    }

    #[test]
    fn dispatch_span_name() {
        let _guard = subscriber_guard();
        let span = step_dispatch_span("small-models", "smoke", "g2", 1);
        assert_eq!(span.metadata().unwrap().name(), "gauntlet.dispatch");
    }

    #[test]
    fn lease_span_name() {
        let _guard = subscriber_guard();
        let span = lease_acquire_span("smoke", "g2");
        assert_eq!(span.metadata().unwrap().name(), "gauntlet.lease");
    }

    #[test]
    fn stage_span_name() {
        let _guard = subscriber_guard();
        let span = stage_span("small-models");
        assert_eq!(span.metadata().unwrap().name(), "gauntlet.stage");
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_step_finished("s", "x", "passed", 1, 0.5);
        record_stage_finished("s", "passed");
        record_run_finished("passed", 1.0);
    }
}
