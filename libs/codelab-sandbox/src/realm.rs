// Interpreter realm: one boa Context per execution, driven synchronously on
// the calling thread. Everything boa-specific stays in this module.
use crate::environment::Environment;
use crate::harness::{self, CapturedConsole, Report};
use anyhow::{anyhow, Context as _, Result};
use boa_engine::error::JsNativeErrorKind;
use boa_engine::{js_string, Context, JsError, JsString, JsValue, Source};
use codelab_common::types::ScriptError;
use codelab_common::value::ScriptValue;
use serde::{Deserialize, Serialize};

/// Caller input that cannot become a job. Nothing was executed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid entry point identifier: {0:?}")]
    InvalidEntryPoint(String),
    #[error("Argument {index} is not transferable: {reason}")]
    UntransferableArgument { index: usize, reason: String },
    #[error("Arguments exceed maximum size of {limit} bytes")]
    ArgumentsTooLarge { limit: usize },
}

/// Everything one realm evaluation needs, owned so it can move to a thread
/// or a worker process
#[derive(Debug, Serialize, Deserialize)]
pub struct RealmJob {
    pub source: String,
    pub entry_point: Option<String>,
    pub args_json: String,
    pub prelude: String,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub stack_size_limit: usize,
}

impl RealmJob {
    pub fn new(
        source: String,
        entry_point: Option<String>,
        args: &[ScriptValue],
        env: &Environment,
    ) -> Result<Self> {
        if let Some(name) = &entry_point {
            if !is_identifier(name) {
                return Err(RequestError::InvalidEntryPoint(name.clone()).into());
            }
        }
        let limits = env.limits();
        Ok(Self {
            source,
            entry_point,
            args_json: harness::encode_args(args)?,
            prelude: harness::prelude(env)?,
            loop_iteration_limit: limits.loop_iteration_limit,
            recursion_limit: limits.recursion_limit,
            stack_size_limit: limits.stack_size_limit,
        })
    }
}

#[derive(Debug)]
pub enum RealmOutcome {
    Returned {
        value: ScriptValue,
        console: CapturedConsole,
    },
    Threw {
        error: ScriptError,
        console: CapturedConsole,
    },
}

/// Plain ASCII identifier; the name is spliced into a lookup expression
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Fail-fast conversion: boa errors are not `Send`, so only their text leaves
fn internal(context: &str, error: JsError) -> anyhow::Error {
    anyhow!("{}: {}", context, error)
}

/// Loop budget exhaustion surfaces as a RangeError; the classifier files it
/// under performance by its message
fn budget_exhausted(message: impl Into<String>) -> ScriptError {
    ScriptError::thrown("RangeError", message)
}

/// Structured error for a failure that escaped the harness
fn script_error(error: &JsError, ctx: &mut Context) -> ScriptError {
    match error.try_native(ctx) {
        Ok(native) => {
            let message = native.message().to_string();
            let name = match &native.kind {
                JsNativeErrorKind::RuntimeLimit => {
                    if message.contains("loop iteration") {
                        return budget_exhausted(message);
                    }
                    // Recursion and stack limits read like an overflow to learners
                    return ScriptError::thrown(
                        "RangeError",
                        format!("Maximum call stack size exceeded ({})", message),
                    );
                }
                JsNativeErrorKind::Aggregate(_) => "AggregateError",
                JsNativeErrorKind::Error => "Error",
                JsNativeErrorKind::Eval => "EvalError",
                JsNativeErrorKind::Range => "RangeError",
                JsNativeErrorKind::Reference => "ReferenceError",
                JsNativeErrorKind::Syntax => "SyntaxError",
                JsNativeErrorKind::Type => "TypeError",
                JsNativeErrorKind::Uri => "URIError",
                _ => "InternalError",
            };
            ScriptError::thrown(name, message)
        }
        Err(_) => ScriptError::opaque(format!("Uncaught {}", error)),
    }
}

fn call_string(
    function: &JsValue,
    args: &[JsValue],
    ctx: &mut Context,
) -> std::result::Result<String, JsError> {
    let object = function
        .as_object()
        .cloned()
        .ok_or_else(|| JsError::from_opaque(JsValue::from(js_string!("harness member is not callable"))))?;
    let value = object.call(&JsValue::undefined(), args, ctx)?;
    Ok(value
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default())
}

fn drain(drain_fn: &JsValue, ctx: &mut Context) -> CapturedConsole {
    match call_string(drain_fn, &[], ctx).map(|text| harness::parse_drain(&text)) {
        Ok(Ok(console)) => console,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to parse drained console");
            CapturedConsole::default()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to drain console");
            CapturedConsole::default()
        }
    }
}

fn failed(error: JsError, drain_fn: &JsValue, ctx: &mut Context) -> RealmOutcome {
    let error = script_error(&error, ctx);
    let console = drain(drain_fn, ctx);
    RealmOutcome::Threw { error, console }
}

/// Evaluate one job in a fresh realm. Blocking; runs on an interpreter
/// thread, in the host or in a worker process.
pub fn evaluate(job: RealmJob) -> Result<RealmOutcome> {
    let mut ctx = Context::default();
    {
        let limits = ctx.runtime_limits_mut();
        limits.set_loop_iteration_limit(job.loop_iteration_limit);
        limits.set_recursion_limit(job.recursion_limit);
        limits.set_stack_size_limit(job.stack_size_limit);
    }

    let harness_value = ctx
        .eval(Source::from_bytes(&job.prelude))
        .map_err(|e| internal("Prelude failed", e))?;
    let harness_object = harness_value
        .as_object()
        .cloned()
        .context("Prelude did not produce the harness object")?;
    let invoke_fn = harness_object
        .get(js_string!("invoke"), &mut ctx)
        .map_err(|e| internal("Harness has no invoke", e))?;
    let drain_fn = harness_object
        .get(js_string!("drain"), &mut ctx)
        .map_err(|e| internal("Harness has no drain", e))?;

    let completion = match ctx.eval(Source::from_bytes(&job.source)) {
        Ok(value) => value,
        Err(e) => return Ok(failed(e, &drain_fn, &mut ctx)),
    };

    let (target, entry) = match &job.entry_point {
        Some(name) => {
            // Lexical bindings (let/const/class) are not global object
            // properties, so resolve the name in the script scope.
            let lookup = format!("typeof {name} === 'undefined' ? undefined : {name}");
            match ctx.eval(Source::from_bytes(&lookup)) {
                Ok(found) => (found, JsValue::from(JsString::from(name.as_str()))),
                Err(e) => return Ok(failed(e, &drain_fn, &mut ctx)),
            }
        }
        None => (completion, JsValue::null()),
    };

    let args = JsValue::from(JsString::from(job.args_json.as_str()));
    let text = match call_string(&invoke_fn, &[target, args, entry], &mut ctx) {
        Ok(text) => text,
        Err(e) => return Ok(failed(e, &drain_fn, &mut ctx)),
    };

    let (report, console) = harness::parse_report(&text)?;
    Ok(match report {
        Report::Returned(value) => RealmOutcome::Returned { value, console },
        Report::Threw(error) if error.name() == Some("RuntimeLimit") => RealmOutcome::Threw {
            error: budget_exhausted(error.message()),
            console,
        },
        Report::Threw(error) => RealmOutcome::Threw { error, console },
    })
}
