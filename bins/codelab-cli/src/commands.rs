// CLI commands for driving the sandbox locally
use anyhow::{bail, Context, Result};
use codelab_common::types::{
    Capabilities, CodeSnippet, ConsoleEntry, ConsoleLevel, ExecutionOptions, ExecutionOutcome, RiskFinding,
    ScriptError, TestSuite,
};
use codelab_common::value::ScriptValue;
use codelab_sandbox::evaluator::describe_result;
use codelab_sandbox::{CancellationToken, Harness, WorkerCommand};
use std::fs;
use std::path::Path;
use tokio::signal;
use tracing::{debug, warn};

use crate::CapabilityFlags;

impl From<CapabilityFlags> for Capabilities {
    fn from(flags: CapabilityFlags) -> Self {
        Capabilities {
            allow_network: flags.allow_network,
            allow_file_system: flags.allow_fs,
            allow_eval: flags.allow_eval,
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    let source = fs::read_to_string(path).with_context(|| format!("Failed to read snippet {}", path.display()))?;
    debug!(path = %path.display(), bytes = source.len(), "Loaded snippet");
    Ok(source)
}

/// Harness whose realms run in re-executed copies of this binary
fn isolated_harness() -> Result<Harness> {
    Ok(Harness::from_default_config()?.with_worker(WorkerCommand::current_exe()?))
}

fn print_finding(finding: &RiskFinding) {
    println!(
        "  {}:{} [{}] {}",
        finding.line, finding.column, finding.pattern_id, finding.message
    );
    println!("      {}", finding.excerpt);
}

fn print_console(entries: &[ConsoleEntry]) {
    for entry in entries {
        let prefix = match entry.level {
            ConsoleLevel::Log => "log  ",
            ConsoleLevel::Info => "info ",
            ConsoleLevel::Warn => "warn ",
            ConsoleLevel::Error => "error",
        };
        println!("  {} │ {}", prefix, entry.render());
    }
}

/// Parse `--args`: a JSON array, or a single JSON value taken as one argument
pub fn parse_args(raw: &str) -> Result<Vec<ScriptValue>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    Ok(match value {
        serde_json::Value::Array(items) => items.into_iter().map(ScriptValue::from).collect(),
        single => vec![ScriptValue::from(single)],
    })
}

pub fn validate(file: &Path, capabilities: CapabilityFlags) -> Result<()> {
    let source = read_source(file)?;
    let harness = Harness::from_default_config()?;
    let options = ExecutionOptions {
        capabilities: capabilities.into(),
        ..ExecutionOptions::default()
    };
    let report = harness.validate_with(&source, &options);

    if !report.errors.is_empty() {
        println!("❌ Errors:");
        report.errors.iter().for_each(print_finding);
    }
    if !report.warnings.is_empty() {
        println!("⚠️  Warnings:");
        report.warnings.iter().for_each(print_finding);
    }

    if !report.is_valid {
        bail!("{} rejected by static analysis", file.display());
    }
    println!("✅ {} is valid", file.display());
    Ok(())
}

pub async fn run(
    file: &Path,
    entry: Option<String>,
    raw_args: &str,
    timeout_ms: Option<u64>,
    capabilities: CapabilityFlags,
) -> Result<()> {
    let source = read_source(file)?;
    let args = parse_args(raw_args)?;
    let harness = isolated_harness()?;
    let options = ExecutionOptions {
        entry_point: entry,
        timeout_ms,
        capabilities: capabilities.into(),
        ..ExecutionOptions::default()
    };

    let result = harness.execute(source, args, options).await?;
    print_console(result.console());

    match &result.outcome {
        ExecutionOutcome::Success { value, .. } => {
            println!("✅ {} ({:.1}ms)", value, result.elapsed_ms());
            Ok(())
        }
        ExecutionOutcome::RuntimeError { error, .. } => {
            let classification = harness.classify_error(error);
            println!(
                "❌ {} [{:?}/{:?}, {:?}] ({:.1}ms)",
                error,
                classification.category,
                classification.kind,
                classification.severity,
                result.elapsed_ms()
            );
            bail!("snippet threw");
        }
        ExecutionOutcome::Timeout { .. } => {
            println!("⏱️  Timed out after {:.1}ms", result.elapsed_ms());
            bail!("snippet timed out");
        }
        ExecutionOutcome::ValidationRejected { findings } => {
            println!("❌ Rejected before execution:");
            findings.iter().for_each(print_finding);
            bail!("snippet rejected by static analysis");
        }
    }
}

pub async fn test(file: &Path, suite_path: &Path) -> Result<()> {
    let source = read_source(file)?;
    let content = fs::read_to_string(suite_path)
        .with_context(|| format!("Failed to read suite {}", suite_path.display()))?;
    let suite: TestSuite = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse suite {}", suite_path.display()))?;
    let harness = isolated_harness()?;

    println!("🧪 Running {} ({} tests)", suite.name, suite.tests.len());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                println!("\n⚠️  Interrupted, stopping after the current test...");
                on_interrupt.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C; the suite cannot be interrupted"),
        }
    });

    let mut handle = harness.start_suite(CodeSnippet::new(source), suite, cancel);
    while let Some(result) = handle.results.recv().await {
        println!("  {}", describe_result(&result));
        print_console(&result.console);
    }

    let summary = handle.finish().await?;
    println!(
        "\n📊 {}/{} passed, {} executed, avg {:.1}ms ({:?})",
        summary.passed, summary.total, summary.executed, summary.avg_duration_ms, summary.state
    );

    if !summary.all_passed() {
        bail!("{} of {} tests did not pass", summary.total - summary.passed, summary.total);
    }
    println!("✅ All tests passed");
    Ok(())
}

pub fn classify(message: &str, name: Option<String>) -> Result<()> {
    let error = match name {
        Some(name) => ScriptError::thrown(name, message),
        None => ScriptError::opaque(message),
    };
    let harness = Harness::from_default_config()?;
    let classification = harness.classify_error(&error);
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_sandbox::comparator::compare;

    #[test]
    fn test_parse_args_array_and_scalar() {
        let args = parse_args("[[1, 2], \"x\"]").unwrap();
        assert_eq!(args.len(), 2);
        assert!(compare(&args[1], &ScriptValue::from("x")));

        let single = parse_args("5").unwrap();
        assert_eq!(single.len(), 1);
        assert!(compare(&single[0], &ScriptValue::from(5)));

        assert!(parse_args("not json").is_err());
    }

    #[test]
    fn test_parse_args_escape_forms() {
        let args = parse_args(r#"[{"$num": "NaN"}, {"$undefined": true}]"#).unwrap();
        assert!(args[0].as_f64().unwrap().is_nan());
        assert!(matches!(args[1], ScriptValue::Undefined));
    }

    #[test]
    fn test_capability_flags_map_to_capabilities() {
        let flags = CapabilityFlags {
            allow_network: true,
            allow_fs: false,
            allow_eval: true,
        };
        let caps: Capabilities = flags.into();
        assert!(caps.allow_network);
        assert!(!caps.allow_file_system);
        assert!(caps.allow_eval);
    }
}
