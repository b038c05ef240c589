/// Test Orchestrator - Suite Sequencing
///
/// **Responsibility:**
/// Run many (snippet, test case) pairs one after another and aggregate the
/// outcome, with cooperative cancellation between tests.
///
/// **Architecture:**
/// 1. SandboxEngine runs each test in its own realm (engine.rs)
/// 2. Evaluator judges each result (evaluator.rs)
/// 3. Results stream out as they land; the summary comes at the end
///
/// A failing test never aborts the suite, and a suite always ends with a
/// summary, even when cancelled.

use crate::cancel::CancellationToken;
use crate::engine::SandboxEngine;
use crate::environment::EnvironmentBuilder;
use crate::evaluator::{aggregate_results, evaluate_test, internal_failure};
use anyhow::{Context, Result};
use codelab_common::config::SandboxConfig;
use codelab_common::types::{
    Capabilities, CodeSnippet, ExecutionRequest, SandboxFixtures, SuiteRun, SuiteState, SuiteSummary,
    TestCase, TestResult,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Live view of a running suite
pub struct SuiteHandle {
    pub run_id: Uuid,
    /// One item per finished test, in order
    pub results: mpsc::UnboundedReceiver<TestResult>,
    /// Latest snapshot of the run; partial results are always inspectable
    pub progress: watch::Receiver<SuiteRun>,
    pub cancel: CancellationToken,
    task: JoinHandle<SuiteSummary>,
}

impl SuiteHandle {
    pub fn snapshot(&self) -> SuiteRun {
        self.progress.borrow().clone()
    }

    /// Wait for the summary
    pub async fn finish(self) -> Result<SuiteSummary> {
        self.task.await.context("Suite task failed")
    }
}

#[derive(Clone)]
pub struct TestOrchestrator {
    engine: Arc<SandboxEngine>,
    environments: EnvironmentBuilder,
    config: Arc<SandboxConfig>,
    capabilities: Capabilities,
}

impl TestOrchestrator {
    pub fn new(engine: Arc<SandboxEngine>, config: Arc<SandboxConfig>) -> Self {
        Self {
            engine,
            environments: EnvironmentBuilder::new(&config),
            config,
            capabilities: Capabilities::none(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_fixtures(mut self, fixtures: SandboxFixtures) -> Self {
        self.environments = self.environments.with_fixtures(fixtures);
        self
    }

    /// Run one test in a fresh environment. Never fails: engine-internal
    /// errors become a failed result of kind `InternalError`.
    #[tracing::instrument(skip(self, snippet, test), fields(test_id = %test.id))]
    pub async fn run_test(&self, snippet: &CodeSnippet, test: &TestCase) -> TestResult {
        let env = self.environments.build(self.capabilities);
        let timeout = self.config.effective_timeout(test.timeout_ms);
        let request = ExecutionRequest::new(snippet.clone(), test.args.clone(), timeout)
            .with_capabilities(self.capabilities);

        let started = Instant::now();
        match self.engine.execute(request, env).await {
            Ok(result) => evaluate_test(&result, test),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Engine failure; test marked failed");
                let elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;
                internal_failure(test, format!("{:#}", e), elapsed_ms)
            }
        }
    }

    /// Spawn a suite run and return its live handle
    pub fn start_suite(&self, snippet: CodeSnippet, tests: Vec<TestCase>, cancel: CancellationToken) -> SuiteHandle {
        let run = SuiteRun::new(tests);
        let run_id = run.run_id;
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(run.clone());

        let orchestrator = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .drive(snippet, run, token, results_tx, progress_tx)
                .await
        });

        SuiteHandle {
            run_id,
            results: results_rx,
            progress: progress_rx,
            cancel,
            task,
        }
    }

    /// Run a suite to the end and return only the summary
    pub async fn run_suite(
        &self,
        snippet: CodeSnippet,
        tests: Vec<TestCase>,
        cancel: CancellationToken,
    ) -> Result<SuiteSummary> {
        self.start_suite(snippet, tests, cancel).finish().await
    }

    async fn drive(
        self,
        snippet: CodeSnippet,
        mut run: SuiteRun,
        cancel: CancellationToken,
        results: mpsc::UnboundedSender<TestResult>,
        progress: watch::Sender<SuiteRun>,
    ) -> SuiteSummary {
        transition(&mut run, SuiteState::Running);
        progress.send_replace(run.clone());

        let total = run.tests.len();
        info!(run_id = %run.run_id, total, "Starting suite");

        let tests = run.tests.clone();
        for (idx, test) in tests.iter().enumerate() {
            // Check for cancellation before each test case
            if cancel.is_cancelled() {
                info!(completed = idx, total, "Suite cancelled; stopping before next test");
                break;
            }

            let result = self.run_test(&snippet, test).await;
            info!(
                test_id = %result.test_id,
                passed = result.passed,
                duration_ms = result.duration_ms,
                "Test finished"
            );

            run.record(result.clone());
            // The consumer may have stopped listening; the run still completes
            let _ = results.send(result);
            progress.send_replace(run.clone());
        }

        let final_state = if run.results.len() < total {
            SuiteState::Cancelled
        } else {
            SuiteState::Completed
        };
        transition(&mut run, final_state);
        progress.send_replace(run.clone());

        let summary = aggregate_results(&run);
        info!(
            run_id = %summary.run_id,
            state = ?summary.state,
            passed = summary.passed,
            total = summary.total,
            avg_duration_ms = summary.avg_duration_ms,
            "Suite finished"
        );
        summary
    }
}

fn transition(run: &mut SuiteRun, next: SuiteState) {
    if let Err(e) = run.advance(next) {
        warn!(error = %e, "Ignoring invalid suite transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::value::ScriptValue;

    fn orchestrator() -> TestOrchestrator {
        let config = Arc::new(SandboxConfig::default());
        TestOrchestrator::new(Arc::new(SandboxEngine::new(&config)), config)
    }

    fn case(id: &str, args: Vec<ScriptValue>, expected: ScriptValue) -> TestCase {
        TestCase {
            id: id.to_string(),
            description: String::new(),
            args,
            expected_output: expected,
            timeout_ms: None,
            visible: true,
        }
    }

    #[tokio::test]
    async fn test_run_test_internal_error_is_a_failed_result() {
        let snippet = CodeSnippet::new("function f() {}").with_entry_point("not valid");
        let result = orchestrator()
            .run_test(&snippet, &case("t", vec![], ScriptValue::Null))
            .await;
        assert!(!result.passed);
        assert_eq!(
            result.error.unwrap().kind,
            codelab_common::types::FailureKind::InternalError
        );
    }

    #[tokio::test]
    async fn test_pre_cancelled_suite_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let snippet = CodeSnippet::new("function id(x) { return x; }").with_entry_point("id");
        let tests = vec![case("a", vec![ScriptValue::from(1)], ScriptValue::from(1))];
        let summary = orchestrator().run_suite(snippet, tests, cancel).await.unwrap();
        assert_eq!(summary.state, SuiteState::Cancelled);
        assert_eq!(summary.executed, 0);
        assert_eq!(summary.total, 1);
    }

    #[tokio::test]
    async fn test_results_stream_in_order() {
        let snippet = CodeSnippet::new("function id(x) { return x; }").with_entry_point("id");
        let tests = vec![
            case("first", vec![ScriptValue::from(1)], ScriptValue::from(1)),
            case("second", vec![ScriptValue::from(2)], ScriptValue::from(2)),
        ];
        let mut handle = orchestrator().start_suite(snippet, tests, CancellationToken::new());
        let mut seen = Vec::new();
        while let Some(result) = handle.results.recv().await {
            seen.push(result.test_id);
        }
        assert_eq!(seen, vec!["first", "second"]);
        let summary = handle.finish().await.unwrap();
        assert_eq!(summary.state, SuiteState::Completed);
        assert_eq!(summary.passed, 2);
    }
}
