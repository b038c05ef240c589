/// Test Evaluator - Judging Execution Results
///
/// **Core Responsibility:**
/// Turn one ExecutionResult into one TestResult, and a finished run into a
/// SuiteSummary.
///
/// **Critical Properties:**
/// - Knows nothing about realms, threads or timers
/// - Pure function: (execution result, test case) -> test result
///
/// **Judging Priority:**
/// 1. Validation rejection (snippet never ran)
/// 2. Runtime error
/// 3. Timeout
/// 4. Structural comparison of the produced value

use crate::classifier;
use crate::comparator;
use codelab_common::types::{
    ExecutionOutcome, ExecutionResult, FailureKind, SuiteRun, SuiteSummary, TestCase, TestFailure,
    TestResult,
};
use codelab_common::value::ScriptValue;

/// Evaluate a single test case execution
pub fn evaluate_test(result: &ExecutionResult, test_case: &TestCase) -> TestResult {
    let console = result.console().to_vec();
    let (passed, actual, error) = match &result.outcome {
        ExecutionOutcome::ValidationRejected { findings } => {
            let ids: Vec<&str> = findings.iter().map(|f| f.pattern_id.as_str()).collect();
            let failure = TestFailure {
                kind: FailureKind::ValidationRejected,
                message: format!("Snippet rejected before execution: {}", ids.join(", ")),
                classification: None,
                mismatch_path: None,
            };
            (false, None, Some(failure))
        }
        ExecutionOutcome::RuntimeError { error, .. } => {
            let failure = TestFailure {
                kind: FailureKind::RuntimeError,
                message: error.to_string(),
                classification: Some(classifier::classify(error)),
                mismatch_path: None,
            };
            (false, None, Some(failure))
        }
        ExecutionOutcome::Timeout { .. } => {
            let failure = TestFailure {
                kind: FailureKind::ExecutionTimeout,
                message: format!("Execution timed out after {:.0}ms", result.elapsed_ms()),
                classification: classifier::classify_outcome(&result.outcome),
                mismatch_path: None,
            };
            (false, None, Some(failure))
        }
        ExecutionOutcome::Success { value, .. } => {
            match comparator::first_mismatch(value, &test_case.expected_output) {
                None => (true, Some(value.clone()), None),
                Some(path) => {
                    let failure = TestFailure {
                        kind: FailureKind::ComparisonMismatch,
                        message: format!("Expected {}, got {}", test_case.expected_output, value),
                        classification: None,
                        mismatch_path: Some(path),
                    };
                    (false, Some(value.clone()), Some(failure))
                }
            }
        }
    };

    TestResult {
        test_id: test_case.id.clone(),
        passed,
        actual,
        expected: test_case.expected_output.clone(),
        duration_ms: result.elapsed_ms(),
        error,
        console,
        visible: test_case.visible,
    }
}

/// Failed result for an engine-internal failure; the suite keeps going
pub fn internal_failure(test_case: &TestCase, message: String, duration_ms: f64) -> TestResult {
    TestResult {
        test_id: test_case.id.clone(),
        passed: false,
        actual: None,
        expected: test_case.expected_output.clone(),
        duration_ms,
        error: Some(TestFailure {
            kind: FailureKind::InternalError,
            message,
            classification: None,
            mismatch_path: None,
        }),
        console: Vec::new(),
        visible: test_case.visible,
    }
}

/// Aggregate a run (complete or partial) into its summary
pub fn aggregate_results(run: &SuiteRun) -> SuiteSummary {
    let executed = run.results.len();
    let passed = run.passed();
    let avg_duration_ms = if executed == 0 {
        0.0
    } else {
        run.results.iter().map(|r| r.duration_ms).sum::<f64>() / executed as f64
    };

    SuiteSummary {
        run_id: run.run_id,
        state: run.state,
        passed,
        failed: executed - passed,
        total: run.tests.len(),
        executed,
        avg_duration_ms,
        results: run.results.clone(),
    }
}

/// One-line human rendering of a result, used by the CLI and logs
pub fn describe_result(result: &TestResult) -> String {
    if result.passed {
        return format!("✓ {} ({:.1}ms)", result.test_id, result.duration_ms);
    }
    let reason = result
        .error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "failed".to_string());
    let actual = result
        .actual
        .as_ref()
        .map(ScriptValue::to_string)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "✗ {} ({:.1}ms): {} [expected {}, actual {}]",
        result.test_id, result.duration_ms, reason, result.expected, actual
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::types::{ErrorKind, ScriptError, SuiteState};
    use std::time::Duration;
    use uuid::Uuid;

    /// Helper to create a test case
    fn make_test_case(id: &str, expected: ScriptValue) -> TestCase {
        TestCase {
            id: id.to_string(),
            description: String::new(),
            args: Vec::new(),
            expected_output: expected,
            timeout_ms: None,
            visible: true,
        }
    }

    fn make_result(outcome: ExecutionOutcome, ms: u64) -> ExecutionResult {
        ExecutionResult {
            execution_id: Uuid::new_v4(),
            outcome,
            elapsed: Duration::from_millis(ms),
        }
    }

    fn success(value: ScriptValue) -> ExecutionOutcome {
        ExecutionOutcome::Success {
            value,
            console: Vec::new(),
        }
    }

    #[test]
    fn test_evaluate_test_exact_match() {
        let test_case = make_test_case("even", ScriptValue::array([2, 4]));
        let result = evaluate_test(&make_result(success(ScriptValue::array([2, 4])), 42), &test_case);

        assert!(result.passed);
        assert_eq!(result.test_id, "even");
        assert_eq!(result.duration_ms, 42.0);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_evaluate_test_mismatch() {
        let test_case = make_test_case("even", ScriptValue::array([2, 4]));
        let result = evaluate_test(&make_result(success(ScriptValue::array([2, 5])), 5), &test_case);

        assert!(!result.passed);
        let error = result.error.unwrap();
        assert_eq!(error.kind, FailureKind::ComparisonMismatch);
        assert_eq!(error.mismatch_path.as_deref(), Some("$[1]"));
        assert!(result.actual.is_some());
    }

    #[test]
    fn test_evaluate_test_runtime_error() {
        let test_case = make_test_case("t", ScriptValue::from(1));
        let outcome = ExecutionOutcome::RuntimeError {
            error: ScriptError::thrown("ReferenceError", "x is not defined"),
            console: Vec::new(),
        };
        let result = evaluate_test(&make_result(outcome, 5), &test_case);

        let error = result.error.unwrap();
        assert_eq!(error.kind, FailureKind::RuntimeError);
        assert_eq!(error.classification.unwrap().kind, ErrorKind::Reference);
        assert!(result.actual.is_none());
    }

    #[test]
    fn test_evaluate_test_timeout() {
        let test_case = make_test_case("t", ScriptValue::from(1));
        let result = evaluate_test(&make_result(ExecutionOutcome::Timeout { abandoned: true }, 1001), &test_case);

        let error = result.error.unwrap();
        assert_eq!(error.kind, FailureKind::ExecutionTimeout);
        assert_eq!(error.classification.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_aggregate_partial_run() {
        let tests = vec![
            make_test_case("a", ScriptValue::from(1)),
            make_test_case("b", ScriptValue::from(2)),
            make_test_case("c", ScriptValue::from(3)),
        ];
        let mut run = SuiteRun::new(tests.clone());
        run.advance(SuiteState::Running).unwrap();
        run.record(evaluate_test(&make_result(success(ScriptValue::from(1)), 10), &tests[0]));
        run.record(evaluate_test(&make_result(success(ScriptValue::from(0)), 20), &tests[1]));
        run.advance(SuiteState::Cancelled).unwrap();

        let summary = aggregate_results(&run);
        assert_eq!(summary.state, SuiteState::Cancelled);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.avg_duration_ms, 15.0);
    }

    #[test]
    fn test_describe_result() {
        let test_case = make_test_case("sum", ScriptValue::from(3));
        let passed = evaluate_test(&make_result(success(ScriptValue::from(3)), 1), &test_case);
        assert!(describe_result(&passed).starts_with("✓ sum"));
        let failed = evaluate_test(&make_result(success(ScriptValue::from(4)), 1), &test_case);
        assert!(describe_result(&failed).contains("expected 3, actual 4"));
    }
}
