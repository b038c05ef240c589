// HTTP route handlers for the Codelab API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use codelab_common::store;
use codelab_common::types::{
    Capabilities, CodeSnippet, ExecutionOptions, ScriptError, SuiteSummary, TestCase, TestSuite,
};
use codelab_common::value::ScriptValue;
use codelab_sandbox::{CancellationToken, RequestError};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub source: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub source: String,
    #[serde(default)]
    pub args: Vec<ScriptValue>,
    #[serde(flatten)]
    pub options: ExecutionOptions,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub snippet: CodeSnippet,
    pub test: TestCase,
}

#[derive(Debug, Deserialize)]
pub struct SuiteRequest {
    pub snippet: CodeSnippet,
    pub suite: TestSuite,
    #[serde(flatten)]
    pub credit: SuiteCredit,
}

/// Who gets credit when every test in a suite passes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteCredit {
    pub user_id: Option<String>,
    pub challenge_id: Option<String>,
    /// Overrides the suite's own point value
    pub points: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub message: String,
    /// Error constructor name, when the caller has one
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompletionStatus {
    pub newly_completed: bool,
    pub total_points: u64,
}

#[derive(Debug, Serialize)]
pub struct SuiteResponse {
    #[serde(flatten)]
    pub summary: SuiteSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionStatus>,
}

impl SuiteResponse {
    /// Hidden test details never leave the server
    fn new(mut summary: SuiteSummary, completion: Option<CompletionStatus>) -> Self {
        summary.results = summary.results.iter().map(|r| r.redacted()).collect();
        Self { summary, completion }
    }
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub user_id: String,
    pub points: u64,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn internal_error(message: String) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// POST /validate - Static analysis only, nothing runs
pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ValidateRequest>,
) -> impl IntoResponse {
    let options = ExecutionOptions {
        capabilities: payload.capabilities,
        ..ExecutionOptions::default()
    };
    let report = state.harness.validate_with(&payload.source, &options);
    info!(
        is_valid = report.is_valid,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Snippet validated"
    );
    (StatusCode::OK, Json(report))
}

/// POST /execute - Ad hoc run (playground)
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    match state
        .harness
        .execute(payload.source, payload.args, payload.options)
        .await
    {
        Ok(result) => {
            metrics::record_execution(&result);
            info!(
                execution_id = %result.execution_id,
                outcome = result.outcome_label(),
                elapsed_ms = result.elapsed_ms(),
                "Execution finished"
            );
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => match e.downcast_ref::<RequestError>() {
            Some(invalid) => {
                warn!(error = %invalid, "Rejected malformed execution request");
                error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {}", invalid))
            }
            None => {
                error!(error = %format!("{:#}", e), "Execution failed inside the engine");
                internal_error(format!("Execution failed: {:#}", e))
            }
        },
    }
}

/// POST /test - One test case against one snippet
pub async fn run_test(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TestRequest>,
) -> impl IntoResponse {
    let result = state.harness.run_test(&payload.snippet, &payload.test).await;
    metrics::record_test(&result);
    (StatusCode::OK, Json(result.redacted()))
}

/// POST /suite - Run a whole suite and answer with its summary
pub async fn run_suite(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SuiteRequest>,
) -> Response {
    let points = payload.credit.points.unwrap_or(payload.suite.points);
    let summary = match state
        .harness
        .run_suite(payload.snippet, payload.suite, CancellationToken::new())
        .await
    {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Suite run failed");
            return internal_error(format!("Suite run failed: {:#}", e));
        }
    };

    let completion = finish_suite(&state, &payload.credit, points, &summary).await;
    (StatusCode::OK, Json(SuiteResponse::new(summary, completion))).into_response()
}

/// Cancels the suite when the stream is dropped before it finished
struct CancelOnDrop {
    token: CancellationToken,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            warn!("Suite stream dropped by client; cancelling");
            self.token.cancel();
        }
    }
}

/// POST /suite/stream - Server-sent events: one `result` per test, then `summary`
pub async fn stream_suite(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SuiteRequest>,
) -> impl IntoResponse {
    let points = payload.credit.points.unwrap_or(payload.suite.points);
    let credit = payload.credit;
    let cancel = CancellationToken::new();
    let handle = state
        .harness
        .start_suite(payload.snippet, payload.suite, cancel.clone());
    info!(run_id = %handle.run_id, "Streaming suite");

    let guard = CancelOnDrop {
        token: cancel,
        armed: true,
    };

    let events = stream::unfold(Some((handle, guard, state, credit)), move |slot| async move {
        let (mut handle, mut guard, state, credit) = slot?;

        if let Some(result) = handle.results.recv().await {
            metrics::record_test(&result);
            let event = Event::default().event("result").json_data(result.redacted());
            return Some((event, Some((handle, guard, state, credit))));
        }

        guard.armed = false;
        let event = match handle.finish().await {
            Ok(summary) => {
                let completion = finish_suite(&state, &credit, points, &summary).await;
                Event::default()
                    .event("summary")
                    .json_data(SuiteResponse::new(summary, completion))
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Streamed suite failed");
                Event::default()
                    .event("error")
                    .json_data(serde_json::json!({ "error": format!("{:#}", e) }))
            }
        };
        Some((event, None))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Metrics plus, for a fully passing suite with a user and challenge, the
/// one-time completion record
async fn finish_suite(
    state: &AppState,
    credit: &SuiteCredit,
    points: u32,
    summary: &SuiteSummary,
) -> Option<CompletionStatus> {
    metrics::record_suite(summary.state);

    let (user_id, challenge_id) = match (&credit.user_id, &credit.challenge_id) {
        (Some(user), Some(challenge)) if summary.all_passed() => (user.clone(), challenge.clone()),
        _ => return None,
    };

    let store = state.store.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let newly_completed = store::record_completion(store.as_ref(), &user_id, &challenge_id, points)?;
        let total_points = store::points(store.as_ref(), &user_id)?;
        anyhow::Ok(CompletionStatus {
            newly_completed,
            total_points,
        })
    })
    .await;

    match outcome {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            error!(run_id = %summary.run_id, error = %format!("{:#}", e), "Failed to record completion");
            None
        }
        Err(e) => {
            error!(run_id = %summary.run_id, error = %e, "Completion task panicked");
            None
        }
    }
}

/// POST /classify - Classify an error message
pub async fn classify(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ClassifyRequest>,
) -> impl IntoResponse {
    let error = match payload.name {
        Some(name) => ScriptError::thrown(name, payload.message),
        None => ScriptError::opaque(payload.message),
    };
    (StatusCode::OK, Json(state.harness.classify_error(&error)))
}

/// GET /progress/:user_id - Point total for a user
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let store = state.store.clone();
    let lookup = user_id.clone();
    match tokio::task::spawn_blocking(move || store::points(store.as_ref(), &lookup)).await {
        Ok(Ok(points)) => (StatusCode::OK, Json(ProgressResponse { user_id, points })).into_response(),
        Ok(Err(e)) => {
            error!(user_id = %user_id, error = %format!("{:#}", e), "Failed to read progress");
            internal_error(format!("Failed to read progress: {:#}", e))
        }
        Err(e) => internal_error(format!("Progress lookup panicked: {}", e)),
    }
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "abandoned_executions": state.harness.abandoned_executions(),
            "checked_at": chrono::Utc::now().to_rfc3339(),
            "instance": instance_id().to_string(),
        })),
    )
}

fn instance_id() -> Uuid {
    static INSTANCE: std::sync::OnceLock<Uuid> = std::sync::OnceLock::new();
    *INSTANCE.get_or_init(Uuid::new_v4)
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match metrics::gather(state.harness.abandoned_executions()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => internal_error(format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::config::SandboxConfig;
    use codelab_common::store::MemoryStore;
    use codelab_sandbox::Harness;

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            harness: Harness::new(SandboxConfig::default()),
            store: Arc::new(MemoryStore::new()),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn suite_request(user: &str) -> SuiteRequest {
        serde_json::from_value(serde_json::json!({
            "snippet": {
                "source": "function double(x) { return x * 2; }",
                "entry_point": "double"
            },
            "suite": {
                "name": "double",
                "points": 25,
                "tests": [
                    { "id": "one", "args": [1], "expected": 2 },
                    { "id": "two", "args": [21], "expected": 42, "visible": false }
                ]
            },
            "user_id": user,
            "challenge_id": "double"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_returns_tagged_outcome() {
        let payload: ExecuteRequest = serde_json::from_value(serde_json::json!({
            "source": "function add(a, b) { console.log('adding'); return a + b; }",
            "entry_point": "add",
            "args": [2, 3]
        }))
        .unwrap();

        let response = execute(State(state()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["value"], 5);
        assert_eq!(body["console"][0]["values"][0], "adding");
    }

    #[tokio::test]
    async fn test_malformed_execute_is_a_bad_request() {
        let bad_entry: ExecuteRequest = serde_json::from_value(serde_json::json!({
            "source": "function f() {}",
            "entry_point": "a; b"
        }))
        .unwrap();
        let response = execute(State(state()), Json(bad_entry)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("entry point"));

        let payload = ExecuteRequest {
            source: "(f) => 1".to_string(),
            args: vec![ScriptValue::Function("f".to_string())],
            options: ExecutionOptions::default(),
        };
        let response = execute(State(state()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_passing_suites_award_once() {
        let state = state();
        let (left, right) = tokio::join!(
            run_suite(State(state.clone()), Json(suite_request("linus"))),
            run_suite(State(state.clone()), Json(suite_request("linus")))
        );
        let (left, right) = (body_json(left).await, body_json(right).await);

        let newly = [&left, &right]
            .iter()
            .filter(|body| body["completion"]["newly_completed"] == true)
            .count();
        assert_eq!(newly, 1);

        let progress = body_json(get_progress(State(state), Path("linus".to_string())).await).await;
        assert_eq!(progress["points"], 25);
    }

    #[tokio::test]
    async fn test_validate_flags_network_access() {
        let payload = ValidateRequest {
            source: "fetch('http://x')".to_string(),
            capabilities: Capabilities::none(),
        };
        let response = validate(State(state()), Json(payload)).await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["is_valid"], false);
        assert_eq!(body["errors"][0]["pattern_id"], "network-fetch");
    }

    #[tokio::test]
    async fn test_passing_suite_awards_points_once() {
        let state = state();

        let first = body_json(run_suite(State(state.clone()), Json(suite_request("ada"))).await).await;
        assert_eq!(first["passed"], 2);
        assert_eq!(first["completion"]["newly_completed"], true);
        assert_eq!(first["completion"]["total_points"], 25);

        let second = body_json(run_suite(State(state.clone()), Json(suite_request("ada"))).await).await;
        assert_eq!(second["completion"]["newly_completed"], false);
        assert_eq!(second["completion"]["total_points"], 25);

        let progress = body_json(get_progress(State(state), Path("ada".to_string())).await).await;
        assert_eq!(progress["points"], 25);
    }

    #[tokio::test]
    async fn test_failing_suite_records_nothing() {
        let state = state();
        let mut request = suite_request("grace");
        request.suite.tests[0].expected_output = ScriptValue::from(3);

        let body = body_json(run_suite(State(state.clone()), Json(request)).await).await;
        assert_eq!(body["passed"], 1);
        assert!(body.get("completion").is_none());

        let progress = body_json(get_progress(State(state), Path("grace".to_string())).await).await;
        assert_eq!(progress["points"], 0);
    }

    #[tokio::test]
    async fn test_classify_uses_error_name() {
        let payload = ClassifyRequest {
            message: "x is not defined".to_string(),
            name: Some("ReferenceError".to_string()),
        };
        let body = body_json(classify(State(state()), Json(payload)).await.into_response()).await;
        assert_eq!(body["kind"], "reference");
    }
}
