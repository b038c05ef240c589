// Realms in worker processes: crash containment and kill-on-timeout
use codelab_common::config::SandboxConfig;
use codelab_common::types::{ExecutionOptions, ExecutionOutcome};
use codelab_common::value::ScriptValue;
use codelab_sandbox::{Harness, WorkerCommand};
use std::time::Duration;

fn isolated(config: SandboxConfig) -> Harness {
    Harness::new(config).with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_codelab-realm")))
}

fn range_error(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::RuntimeError { error, .. } => {
            assert_eq!(error.name(), Some("RangeError"), "unexpected error {}", error);
            error.message().to_string()
        }
        other => panic!("expected a RangeError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_worker_returns_value_and_console() {
    let harness = isolated(SandboxConfig::default());
    let options = ExecutionOptions {
        entry_point: Some("add".to_string()),
        ..ExecutionOptions::default()
    };
    let source = "function add(a, b) { console.log('adding', a, NaN); return a + b; }";
    let result = harness
        .execute(source, vec![ScriptValue::from(2), ScriptValue::from(3)], options)
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.value().and_then(ScriptValue::as_f64), Some(5.0));
    assert_eq!(result.console()[0].render(), "adding 2 NaN");
}

#[tokio::test]
async fn test_parser_stack_overflow_is_contained() {
    let config = SandboxConfig {
        max_source_bytes: 1024 * 1024,
        max_nesting_depth: 1_000_000,
        thread_stack_bytes: 1024 * 1024,
        ..SandboxConfig::default()
    };
    let harness = isolated(config);
    let source = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));

    let result = harness.execute(source, vec![], ExecutionOptions::default()).await.unwrap();
    assert!(range_error(&result.outcome).contains("stack"));

    // The host and the harness are still usable
    let next = harness.execute("1 + 1", vec![], ExecutionOptions::default()).await.unwrap();
    assert_eq!(next.value().and_then(ScriptValue::as_f64), Some(2.0));
}

#[tokio::test]
async fn test_deep_json_stringify_is_a_range_error() {
    let harness = isolated(SandboxConfig::default());
    let source = "let a = []; for (let i = 0; i < 200000; i++) { a = [a]; } JSON.stringify(a).length";
    let result = harness.execute(source, vec![], ExecutionOptions::default()).await.unwrap();
    range_error(&result.outcome);
}

#[tokio::test]
async fn test_timed_out_worker_is_killed() {
    let config = SandboxConfig {
        loop_iteration_limit: u64::MAX,
        ..SandboxConfig::default()
    };
    let harness = isolated(config);
    let options = ExecutionOptions {
        timeout_ms: Some(300),
        ..ExecutionOptions::default()
    };

    let result = harness.execute("for (;;) {}", vec![], options).await.unwrap();
    assert!(matches!(result.outcome, ExecutionOutcome::Timeout { abandoned: false }));
    assert!(result.elapsed >= Duration::from_millis(300));
    assert_eq!(harness.abandoned_executions(), 0);
}
