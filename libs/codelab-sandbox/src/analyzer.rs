/// Static Analyzer - Pre-flight Text Scan
///
/// Scans raw snippet text against an ordered catalogue of forbidden-reference
/// patterns before anything reaches the interpreter. Every match yields one
/// finding with the pattern's fixed severity.
///
/// This is a UX hint, not a boundary: obfuscated references (string
/// concatenation, computed property names, unicode escapes) are not detected.
/// The environment allow-list is what actually withholds host facilities.
///
/// Bracket nesting is bounded too. The interpreter's parser recurses on the
/// native stack once per level, so pathological nesting is rejected here
/// before it can reach a realm.

use codelab_common::config::SandboxConfig;
use codelab_common::types::{Capabilities, RiskFinding, RiskSeverity, ValidationReport};
use regex::Regex;
use std::sync::OnceLock;

const MAX_EXCERPT_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Network,
    FileSystem,
    Eval,
}

impl Grant {
    fn granted(self, capabilities: &Capabilities) -> bool {
        match self {
            Grant::Network => capabilities.allow_network,
            Grant::FileSystem => capabilities.allow_file_system,
            Grant::Eval => capabilities.allow_eval,
        }
    }
}

struct RiskPattern {
    id: &'static str,
    regex: Regex,
    severity: RiskSeverity,
    message: &'static str,
    /// Capability that legitimises the reference
    grant: Option<Grant>,
}

/// (id, pattern, severity, message, grant)
const CATALOGUE: &[(&str, &str, RiskSeverity, &str, Option<Grant>)] = &[
    (
        "process-control",
        r"(?m)\bprocess\s*\.|\brequire\s*\(|\bimport\s*\(|^\s*import\s|\bchild_process\b",
        RiskSeverity::Error,
        "Process and module loading facilities are not available",
        None,
    ),
    (
        "host-storage",
        r"\b(localStorage|sessionStorage|indexedDB)\b|\bdocument\s*\.\s*cookie\b",
        RiskSeverity::Error,
        "Host storage is not available",
        None,
    ),
    (
        "network-fetch",
        r"\bfetch\s*\(",
        RiskSeverity::Error,
        "Network access requires the network capability",
        Some(Grant::Network),
    ),
    (
        "network-socket",
        r"\b(XMLHttpRequest|WebSocket|EventSource)\b|\bsendBeacon\b",
        RiskSeverity::Error,
        "Raw network primitives are not available",
        None,
    ),
    (
        "file-system",
        r"\b(fs|Deno|Bun)\s*\.",
        RiskSeverity::Error,
        "File access requires the file system capability",
        Some(Grant::FileSystem),
    ),
    (
        "dynamic-eval",
        r#"\beval\s*\(|\bnew\s+Function\b|\bFunction\s*\(|\bset(Timeout|Interval)\s*\(\s*['"`]"#,
        RiskSeverity::Error,
        "Dynamic code evaluation requires the eval capability",
        Some(Grant::Eval),
    ),
    (
        "threading",
        r"\b(Worker|SharedWorker|SharedArrayBuffer|Atomics)\b",
        RiskSeverity::Error,
        "Workers and shared memory are not available",
        None,
    ),
    (
        "dom-navigation",
        r"\b(window|document|location|navigator|history)\s*\.",
        RiskSeverity::Error,
        "The page and browser objects are not available",
        None,
    ),
    (
        "prototype-pollution",
        r#"__proto__|\bconstructor\s*\.\s*constructor\b|\bconstructor\s*\[\s*['"]constructor"#,
        RiskSeverity::Error,
        "Prototype tampering is not allowed",
        None,
    ),
    (
        "unbounded-loop",
        r"\bwhile\s*\(\s*(true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\)|\bdo\s*\{[^}]*\}\s*while\s*\(\s*(true|1)\s*\)",
        RiskSeverity::Warning,
        "Loop has no visible exit condition and may hit the timeout",
        None,
    ),
    (
        "debugger",
        r"\bdebugger\b",
        RiskSeverity::Warning,
        "debugger statements have no effect here",
        None,
    ),
    (
        "global-tampering",
        r"\bglobalThis\b|\bsetPrototypeOf\b",
        RiskSeverity::Warning,
        "Global and prototype changes are discarded after the run",
        None,
    ),
];

fn catalogue() -> &'static [RiskPattern] {
    static PATTERNS: OnceLock<Vec<RiskPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CATALOGUE
            .iter()
            .filter_map(|(id, pattern, severity, message, grant)| match Regex::new(pattern) {
                Ok(regex) => Some(RiskPattern {
                    id: *id,
                    regex,
                    severity: *severity,
                    message: *message,
                    grant: *grant,
                }),
                Err(e) => {
                    tracing::error!(pattern_id = id, error = %e, "Skipping invalid risk pattern");
                    None
                }
            })
            .collect()
    })
}

/// Text scanner with configured source size and nesting limits
#[derive(Debug, Clone)]
pub struct StaticAnalyzer {
    max_source_bytes: usize,
    max_nesting_depth: usize,
}

impl Default for StaticAnalyzer {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

impl StaticAnalyzer {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            max_nesting_depth: config.max_nesting_depth,
        }
    }

    /// Findings for a request holding no capabilities
    pub fn analyze(&self, source: &str) -> Vec<RiskFinding> {
        self.analyze_with(source, &Capabilities::none())
    }

    /// Findings whose pattern is backed by a granted capability are
    /// downgraded to warnings.
    pub fn analyze_with(&self, source: &str, capabilities: &Capabilities) -> Vec<RiskFinding> {
        if source.len() > self.max_source_bytes {
            return vec![RiskFinding {
                pattern_id: "source-too-large".to_string(),
                message: format!(
                    "Source is {} bytes, the limit is {} bytes",
                    source.len(),
                    self.max_source_bytes
                ),
                severity: RiskSeverity::Error,
                line: 1,
                column: 1,
                excerpt: String::new(),
            }];
        }

        let mut findings = Vec::new();
        let (depth, offset) = nesting_depth(source);
        if depth > self.max_nesting_depth {
            let (line, column) = position(source, offset);
            findings.push(RiskFinding {
                pattern_id: "nesting-too-deep".to_string(),
                message: format!(
                    "Brackets nest {} levels deep, the limit is {}",
                    depth, self.max_nesting_depth
                ),
                severity: RiskSeverity::Error,
                line,
                column,
                excerpt: excerpt(&source[offset..source.len().min(offset + MAX_EXCERPT_CHARS)]),
            });
        }

        for pattern in catalogue() {
            let severity = match pattern.grant {
                Some(grant) if grant.granted(capabilities) => RiskSeverity::Warning,
                _ => pattern.severity,
            };
            for m in pattern.regex.find_iter(source) {
                let (line, column) = position(source, m.start());
                findings.push(RiskFinding {
                    pattern_id: pattern.id.to_string(),
                    message: pattern.message.to_string(),
                    severity,
                    line,
                    column,
                    excerpt: excerpt(m.as_str()),
                });
            }
        }
        findings
    }

    pub fn validate(&self, source: &str) -> ValidationReport {
        ValidationReport::from_findings(self.analyze(source))
    }

    pub fn validate_with(&self, source: &str, capabilities: &Capabilities) -> ValidationReport {
        ValidationReport::from_findings(self.analyze_with(source, capabilities))
    }
}

/// Scan with default limits
pub fn analyze(source: &str) -> Vec<RiskFinding> {
    StaticAnalyzer::default().analyze(source)
}

pub fn analyze_with(source: &str, capabilities: &Capabilities) -> Vec<RiskFinding> {
    StaticAnalyzer::default().analyze_with(source, capabilities)
}

pub fn validate(source: &str) -> ValidationReport {
    StaticAnalyzer::default().validate(source)
}

/// Deepest `(`/`[`/`{` nesting outside string literals and comments, and the
/// byte offset of the bracket that first reached it. Template literals are
/// skipped except for their `${...}` substitutions.
fn nesting_depth(source: &str) -> (usize, usize) {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut deepest = (0usize, 0usize);
    // Code depth just outside each open `${`
    let mut substitutions: Vec<usize> = Vec::new();
    let mut in_template = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_template {
            match b {
                b'\\' => i += 1,
                b'`' => in_template = false,
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    substitutions.push(depth);
                    depth += 1;
                    if depth > deepest.0 {
                        deepest = (depth, i);
                    }
                    in_template = false;
                    i += 1;
                }
                _ => {}
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' | b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => in_template = true,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            b'(' | b'[' | b'{' => {
                depth += 1;
                if depth > deepest.0 {
                    deepest = (depth, i);
                }
            }
            b'}' if depth > 0 && substitutions.last() == Some(&(depth - 1)) => {
                substitutions.pop();
                depth -= 1;
                in_template = true;
            }
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    deepest
}

/// 1-based line and column (in chars) of a byte offset
fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = source[line_start..offset].chars().count() + 1;
    (line, column)
}

fn excerpt(matched: &str) -> String {
    let trimmed = matched.trim();
    if trimmed.chars().count() <= MAX_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MAX_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(findings: &[RiskFinding]) -> Vec<&str> {
        findings.iter().map(|f| f.pattern_id.as_str()).collect()
    }

    #[test]
    fn test_fetch_is_rejected() {
        let report = validate("fetch('http://x')");
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].pattern_id, "network-fetch");
    }

    #[test]
    fn test_clean_snippet_has_no_findings() {
        let source = "function filterEvenNumbers(xs) { return xs.filter(x => x % 2 === 0); }";
        assert!(analyze(source).is_empty());
    }

    #[test]
    fn test_granted_capability_downgrades() {
        let caps = Capabilities {
            allow_network: true,
            ..Capabilities::none()
        };
        let report = StaticAnalyzer::default().validate_with("const r = fetch('https://api.test/users');", &caps);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let report = validate("while (true) { debugger; }");
        assert!(report.is_valid);
        assert_eq!(ids(&report.warnings), vec!["unbounded-loop", "debugger"]);
    }

    #[test]
    fn test_each_match_is_reported_with_position() {
        let findings = analyze("let a = 1;\nlet b = eval('a');\nlet c = eval('b');");
        let evals: Vec<_> = findings.iter().filter(|f| f.pattern_id == "dynamic-eval").collect();
        assert_eq!(evals.len(), 2);
        assert_eq!((evals[0].line, evals[0].column), (2, 9));
        assert_eq!(evals[1].line, 3);
        assert_eq!(evals[0].excerpt, "eval(");
    }

    #[test]
    fn test_catalogue_covers_forbidden_families() {
        let source = r#"
            require('fs');
            localStorage.setItem('k', 'v');
            new WebSocket('ws://x');
            new Worker('w.js');
            window.location = 'x';
            ({}).__proto__.polluted = true;
        "#;
        let all = analyze(source);
        let found = ids(&all);
        for id in ["process-control", "host-storage", "network-socket", "threading", "dom-navigation", "prototype-pollution"] {
            assert!(found.contains(&id), "missing {} in {:?}", id, found);
        }
    }

    #[test]
    fn test_oversized_source() {
        let config = SandboxConfig {
            max_source_bytes: 16,
            ..SandboxConfig::default()
        };
        let findings = StaticAnalyzer::new(&config).analyze("const x = 'this is too long';");
        assert_eq!(ids(&findings), vec!["source-too-large"]);
        assert_eq!(findings[0].severity, RiskSeverity::Error);
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let source = format!("{}1{}", "(".repeat(30_000), ")".repeat(30_000));
        let report = validate(&source);
        assert!(!report.is_valid);
        assert_eq!(ids(&report.errors), vec!["nesting-too-deep"]);
        assert_eq!((report.errors[0].line, report.errors[0].column), (1, 257));
    }

    #[test]
    fn test_nesting_ignores_strings_and_comments() {
        let brackets = "(".repeat(300);
        let source = format!(
            "const a = '{b}'; const b = \"{b}\"; // {b}\n/* {b} */ const c = `{b}`;",
            b = brackets
        );
        assert!(analyze(&source).is_empty());
        assert_eq!(nesting_depth("f([{ x: `${ g(`${ [1] }`) }` }])"), (7, 18));
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(catalogue().len(), CATALOGUE.len());
    }
}
