use crate::value::ScriptValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Language tag of a snippet. Only one interpreter is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Script,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Script => write!(f, "script"),
        }
    }
}

impl Language {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "script" | "javascript" | "js" => Some(Language::Script),
            _ => None,
        }
    }
}

/// Learner-submitted source text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub source: String,
    #[serde(default)]
    pub language: Language,
    /// Function to call with the arguments. Without one, the completion value
    /// of the snippet is the result (and is called if it is a function).
    #[serde(default)]
    pub entry_point: Option<String>,
}

impl CodeSnippet {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            language: Language::Script,
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = Some(name.into());
        self
    }
}

/// Host facilities a request may opt into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub allow_network: bool,
    pub allow_file_system: bool,
    pub allow_eval: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Request-scoped data backing the capability bindings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxFixtures {
    /// URL -> response body answered by `fetch`
    pub network: BTreeMap<String, String>,
    /// Path -> contents visible through `fs`
    pub files: BTreeMap<String, String>,
}

/// Caller options for an ad hoc run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub entry_point: Option<String>,
    pub timeout_ms: Option<u64>,
    pub capabilities: Capabilities,
    pub fixtures: SandboxFixtures,
}

/// One execution attempt. Consumed by the engine, never reused.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub snippet: CodeSnippet,
    pub args: Vec<ScriptValue>,
    pub timeout: Duration,
    pub capabilities: Capabilities,
}

impl ExecutionRequest {
    pub fn new(snippet: CodeSnippet, args: Vec<ScriptValue>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            snippet,
            args,
            timeout,
            capabilities: Capabilities::none(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// One console call made by a snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub values: Vec<ScriptValue>,
    pub sequence: u64,
}

impl ConsoleEntry {
    /// Space-joined rendering, as a terminal console would print it
    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(ScriptValue::to_console_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Error,
    Warning,
}

/// A forbidden or suspicious reference found by the static analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFinding {
    pub pattern_id: String,
    pub message: String,
    pub severity: RiskSeverity,
    pub line: usize,
    pub column: usize,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<RiskFinding>,
    pub warnings: Vec<RiskFinding>,
}

impl ValidationReport {
    pub fn from_findings(findings: Vec<RiskFinding>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| f.severity == RiskSeverity::Error);
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// A failure raised by the snippet.
///
/// `Thrown` is produced when the failing value was an error object whose name
/// the harness could read. `Opaque` is used when only text crossed the
/// interpreter boundary (parse errors, runtime limits, non-error throws).
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptError {
    #[error("{name}: {message}")]
    Thrown { name: String, message: String },
    #[error("{message}")]
    Opaque { message: String },
}

impl ScriptError {
    pub fn thrown(name: impl Into<String>, message: impl Into<String>) -> Self {
        ScriptError::Thrown {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        ScriptError::Opaque {
            message: message.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ScriptError::Thrown { name, .. } => Some(name),
            ScriptError::Opaque { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ScriptError::Thrown { message, .. } | ScriptError::Opaque { message } => message,
        }
    }
}

/// Kind of a failure, for triage and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Syntax,
    Reference,
    Type,
    Range,
    Uri,
    Eval,
    Aggregate,
    Runtime,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Map a script error constructor name to its kind
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SyntaxError" => Some(ErrorKind::Syntax),
            "ReferenceError" => Some(ErrorKind::Reference),
            "TypeError" => Some(ErrorKind::Type),
            "RangeError" => Some(ErrorKind::Range),
            "URIError" => Some(ErrorKind::Uri),
            "EvalError" => Some(ErrorKind::Eval),
            "AggregateError" => Some(ErrorKind::Aggregate),
            "RuntimeLimit" => Some(ErrorKind::Timeout),
            "Error" | "InternalError" => Some(ErrorKind::Runtime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Parsing,
    Execution,
    Security,
    Performance,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub category: ErrorCategory,
}

/// Outcome of one execution attempt. Exactly one variant is ever populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        value: ScriptValue,
        console: Vec<ConsoleEntry>,
    },
    /// The wall-clock timeout elapsed. `abandoned` is true when the snippet's
    /// in-process thread was left to finish on its own; a worker process is
    /// killed instead and reports false.
    Timeout { abandoned: bool },
    RuntimeError {
        error: ScriptError,
        console: Vec<ConsoleEntry>,
    },
    ValidationRejected { findings: Vec<RiskFinding> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Success { .. })
    }

    pub fn value(&self) -> Option<&ScriptValue> {
        match &self.outcome {
            ExecutionOutcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn console(&self) -> &[ConsoleEntry] {
        match &self.outcome {
            ExecutionOutcome::Success { console, .. }
            | ExecutionOutcome::RuntimeError { console, .. } => console,
            _ => &[],
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_micros() as f64 / 1000.0
    }

    /// Stable label for logs and metrics
    pub fn outcome_label(&self) -> &'static str {
        match self.outcome {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::Timeout { .. } => "timeout",
            ExecutionOutcome::RuntimeError { .. } => "runtime_error",
            ExecutionOutcome::ValidationRejected { .. } => "validation_rejected",
        }
    }
}

/// Authored test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ScriptValue>,
    #[serde(alias = "expected")]
    pub expected_output: ScriptValue,
    /// Per-test timeout; the configured default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// A challenge: snippet contract plus its tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub fixtures: SandboxFixtures,
    /// Points awarded the first time every test passes
    #[serde(default)]
    pub points: u32,
    pub tests: Vec<TestCase>,
}

/// Failure taxonomy surfaced on a failed test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationRejected,
    ExecutionTimeout,
    RuntimeError,
    ComparisonMismatch,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClassification>,
    /// Path of the first differing element, for mismatches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub passed: bool,
    pub actual: Option<ScriptValue>,
    pub expected: ScriptValue,
    pub duration_ms: f64,
    pub error: Option<TestFailure>,
    #[serde(default)]
    pub console: Vec<ConsoleEntry>,
    pub visible: bool,
}

impl TestResult {
    /// Copy with hidden-test details removed, for presentation
    pub fn redacted(&self) -> TestResult {
        if self.visible {
            return self.clone();
        }
        TestResult {
            test_id: self.test_id.clone(),
            passed: self.passed,
            actual: None,
            expected: ScriptValue::Undefined,
            duration_ms: self.duration_ms,
            error: self.error.as_ref().map(|e| TestFailure {
                kind: e.kind,
                message: "hidden test failed".to_string(),
                classification: e.classification,
                mismatch_path: None,
            }),
            console: Vec::new(),
            visible: false,
        }
    }
}

/// Lifecycle of a suite run: Idle -> Running -> (Completed | Cancelled)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl SuiteState {
    pub fn can_transition_to(self, next: SuiteState) -> bool {
        matches!(
            (self, next),
            (SuiteState::Idle, SuiteState::Running)
                | (SuiteState::Running, SuiteState::Completed)
                | (SuiteState::Running, SuiteState::Cancelled)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SuiteState::Completed | SuiteState::Cancelled)
    }
}

/// Progress of one suite: the tests, the results so far and the state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteRun {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub state: SuiteState,
    pub tests: Vec<TestCase>,
    pub results: Vec<TestResult>,
    pub cancel_requested: bool,
}

impl SuiteRun {
    pub fn new(tests: Vec<TestCase>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: None,
            state: SuiteState::Idle,
            tests,
            results: Vec::new(),
            cancel_requested: false,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: SuiteState) -> anyhow::Result<()> {
        if !self.state.can_transition_to(next) {
            anyhow::bail!("invalid suite transition {:?} -> {:?}", self.state, next);
        }
        if next == SuiteState::Running {
            self.started_at = Some(Utc::now());
        }
        if next == SuiteState::Cancelled {
            self.cancel_requested = true;
        }
        self.state = next;
        Ok(())
    }

    pub fn record(&mut self, result: TestResult) {
        self.results.push(result);
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }
}

/// Aggregate of a finished (or cancelled) suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub run_id: Uuid,
    pub state: SuiteState,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub executed: usize,
    pub avg_duration_ms: f64,
    pub results: Vec<TestResult>,
}

impl SuiteSummary {
    pub fn all_passed(&self) -> bool {
        self.state == SuiteState::Completed && self.total > 0 && self.passed == self.total
    }
}

/// Serde helper: `Duration` as fractional milliseconds
pub mod duration_ms {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_micros() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(de::Error::custom("duration must be a non-negative number of milliseconds"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_is_tagged() {
        let result = ExecutionResult {
            execution_id: Uuid::new_v4(),
            outcome: ExecutionOutcome::Timeout { abandoned: true },
            elapsed: Duration::from_millis(50),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("timeout"));
        assert_eq!(value["abandoned"], json!(true));
        assert_eq!(value["elapsed_ms"], json!(50.0));
    }

    #[test]
    fn test_suite_state_transitions() {
        let mut run = SuiteRun::new(Vec::new());
        assert!(run.advance(SuiteState::Completed).is_err());
        run.advance(SuiteState::Running).unwrap();
        assert!(run.started_at.is_some());
        run.advance(SuiteState::Cancelled).unwrap();
        assert!(run.cancel_requested);
        assert!(run.advance(SuiteState::Running).is_err());
    }

    #[test]
    fn test_validation_report_partition() {
        let finding = |severity| RiskFinding {
            pattern_id: "x".into(),
            message: String::new(),
            severity,
            line: 1,
            column: 1,
            excerpt: String::new(),
        };
        let report = ValidationReport::from_findings(vec![
            finding(RiskSeverity::Warning),
            finding(RiskSeverity::Error),
        ]);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_test_case_defaults() {
        let case: TestCase = serde_json::from_value(json!({
            "id": "even-1",
            "args": [[1, 2, 3, 4, 5]],
            "expected": [2, 4]
        }))
        .unwrap();
        assert!(case.visible);
        assert!(case.timeout_ms.is_none());
        assert_eq!(case.args.len(), 1);
    }

    #[test]
    fn test_hidden_result_is_redacted() {
        let result = TestResult {
            test_id: "secret".into(),
            passed: false,
            actual: Some(ScriptValue::from(3)),
            expected: ScriptValue::from(4),
            duration_ms: 1.0,
            error: Some(TestFailure {
                kind: FailureKind::ComparisonMismatch,
                message: "expected 4, got 3".into(),
                classification: None,
                mismatch_path: Some("$".into()),
            }),
            console: Vec::new(),
            visible: false,
        };
        let redacted = result.redacted();
        assert!(redacted.actual.is_none());
        assert_eq!(redacted.error.unwrap().message, "hidden test failed");
    }
}
