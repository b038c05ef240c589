/// Error Classifier - Failure Triage
///
/// Structured errors are classified from the error name captured at the
/// failure point. Opaque text falls back to an ordered list of message
/// predicates; the first match wins.
///
/// Loop budget exhaustion arrives as a `RangeError` but is a performance
/// failure, so its message is checked before the name.

use codelab_common::types::{
    ErrorCategory, ErrorClassification, ErrorKind, ExecutionOutcome, ScriptError, Severity,
};

/// (kind, lowercase needles), checked in order
const MESSAGE_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Timeout,
        &["timeout", "timed out", "loop iteration limit", "runtimelimit"],
    ),
    (
        ErrorKind::Syntax,
        &["syntaxerror", "unexpected token", "unexpected end of input", "abrupt end"],
    ),
    (ErrorKind::Reference, &["referenceerror", "is not defined"]),
    (
        ErrorKind::Type,
        &["typeerror", "is not a function", "cannot read propert", "not a constructor", "not callable"],
    ),
    (
        ErrorKind::Range,
        &["rangeerror", "maximum call stack", "recursion limit", "invalid array length"],
    ),
    (ErrorKind::Uri, &["urierror", "uri malformed"]),
    (ErrorKind::Eval, &["evalerror"]),
    (ErrorKind::Aggregate, &["aggregateerror"]),
    (ErrorKind::Runtime, &["error", "uncaught"]),
];

pub fn category_for(kind: ErrorKind) -> ErrorCategory {
    match kind {
        ErrorKind::Syntax => ErrorCategory::Parsing,
        ErrorKind::Eval => ErrorCategory::Security,
        ErrorKind::Timeout => ErrorCategory::Performance,
        ErrorKind::Unknown => ErrorCategory::Other,
        ErrorKind::Reference
        | ErrorKind::Type
        | ErrorKind::Range
        | ErrorKind::Uri
        | ErrorKind::Aggregate
        | ErrorKind::Runtime => ErrorCategory::Execution,
    }
}

pub fn severity_for(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::Eval => Severity::Critical,
        ErrorKind::Syntax | ErrorKind::Reference | ErrorKind::Timeout => Severity::High,
        ErrorKind::Type | ErrorKind::Range | ErrorKind::Aggregate | ErrorKind::Runtime => Severity::Medium,
        ErrorKind::Uri | ErrorKind::Unknown => Severity::Low,
    }
}

pub fn classification_for(kind: ErrorKind) -> ErrorClassification {
    ErrorClassification {
        kind,
        severity: severity_for(kind),
        category: category_for(kind),
    }
}

/// Kind from free text
pub fn kind_from_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lower.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

const BUDGET_MARKER: &str = "loop iteration limit";

pub fn classify(error: &ScriptError) -> ErrorClassification {
    if error.message().to_lowercase().contains(BUDGET_MARKER) {
        return classification_for(ErrorKind::Timeout);
    }
    let kind = error
        .name()
        .and_then(ErrorKind::from_name)
        .unwrap_or_else(|| kind_from_message(&error.to_string()));
    classification_for(kind)
}

/// Classify free text, e.g. an error message pasted into the CLI
pub fn classify_message(message: &str) -> ErrorClassification {
    classification_for(kind_from_message(message))
}

/// Classification of a failed outcome; None for success and rejections
pub fn classify_outcome(outcome: &ExecutionOutcome) -> Option<ErrorClassification> {
    match outcome {
        ExecutionOutcome::RuntimeError { error, .. } => Some(classify(error)),
        ExecutionOutcome::Timeout { .. } => Some(classification_for(ErrorKind::Timeout)),
        ExecutionOutcome::Success { .. } | ExecutionOutcome::ValidationRejected { .. } => None,
    }
}
