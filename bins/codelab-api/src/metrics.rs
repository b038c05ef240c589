// Prometheus metrics for the Codelab API

use codelab_common::types::{ExecutionResult, FailureKind, SuiteState, TestResult};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

pub struct Metrics {
    registry: Registry,
    executions: IntCounterVec,
    execution_duration: Histogram,
    suite_runs: IntCounterVec,
    abandoned: IntGauge,
}

impl Metrics {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new("codelab_executions_total", "Snippet executions by outcome"),
            &["outcome"],
        )?;
        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "codelab_execution_duration_seconds",
                "Wall time of snippet executions, queueing excluded",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
        )?;
        let suite_runs = IntCounterVec::new(
            Opts::new("codelab_suite_runs_total", "Suite runs by final state"),
            &["state"],
        )?;
        let abandoned = IntGauge::new(
            "codelab_abandoned_executions",
            "Timed-out executions whose interpreter thread is still running",
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(suite_runs.clone()))?;
        registry.register(Box::new(abandoned.clone()))?;

        Ok(Self {
            registry,
            executions,
            execution_duration,
            suite_runs,
            abandoned,
        })
    }
}

lazy_static! {
    static ref METRICS: Option<Metrics> = match Metrics::build() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            error!(error = %e, "Failed to register metrics");
            None
        }
    };
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.as_ref()
}

/// Force registration at startup so a broken registry fails the boot
pub fn init() -> anyhow::Result<()> {
    match metrics() {
        Some(_) => Ok(()),
        None => anyhow::bail!("metrics registry unavailable"),
    }
}

fn observe(outcome: &str, duration_ms: f64) {
    if let Some(m) = metrics() {
        m.executions.with_label_values(&[outcome]).inc();
        m.execution_duration.observe(duration_ms / 1000.0);
    }
}

pub fn record_execution(result: &ExecutionResult) {
    observe(result.outcome_label(), result.elapsed_ms());
}

/// A mismatch still counts as a successful execution
pub fn record_test(result: &TestResult) {
    let outcome = match result.error.as_ref().map(|e| e.kind) {
        None | Some(FailureKind::ComparisonMismatch) => "success",
        Some(FailureKind::ExecutionTimeout) => "timeout",
        Some(FailureKind::RuntimeError) => "runtime_error",
        Some(FailureKind::ValidationRejected) => "validation_rejected",
        Some(FailureKind::InternalError) => "internal_error",
    };
    observe(outcome, result.duration_ms);
}

pub fn record_suite(state: SuiteState) {
    if let Some(m) = metrics() {
        let label = match state {
            SuiteState::Completed => "completed",
            SuiteState::Cancelled => "cancelled",
            SuiteState::Running => "running",
            SuiteState::Idle => "idle",
        };
        m.suite_runs.with_label_values(&[label]).inc();
    }
}

/// Render the registry in the Prometheus text format
pub fn gather(abandoned_executions: usize) -> anyhow::Result<String> {
    let m = match metrics() {
        Some(m) => m,
        None => anyhow::bail!("metrics registry unavailable"),
    };
    m.abandoned.set(abandoned_executions as i64);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buffer) {
        anyhow::bail!("Failed to encode metrics: {}", e);
    }
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_reports_registered_families() {
        init().unwrap();
        record_suite(SuiteState::Completed);
        let text = gather(2).unwrap();
        assert!(text.contains("codelab_suite_runs_total"));
        assert!(text.contains("codelab_abandoned_executions 2"));
    }
}
