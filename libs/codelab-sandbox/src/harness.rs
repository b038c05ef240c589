/// Realm harness: the prelude installed into every fresh interpreter realm and
/// the tagged wire encoding values travel in between host and realm.
///
/// Plain JSON loses `NaN`, `Infinity`, `-0`, `undefined`, BigInt and cycles,
/// so every value crossing the boundary is wrapped as `{"t": tag, "v": ...}`.

use crate::environment::Environment;
use crate::realm::RequestError;
use anyhow::{bail, Context, Result};
use codelab_common::types::{ConsoleEntry, ConsoleLevel, ScriptError};
use codelab_common::value::{special_number, ScriptValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PRELUDE: &str = include_str!("prelude.js");

/// Tagged wire value, mirrors the prelude's `encode`/`decode`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Wire {
    Undefined,
    Null,
    Bool(bool),
    Num(NumRepr),
    Str(String),
    Bigint(String),
    Symbol(String),
    Function(String),
    Array(Vec<Wire>),
    Object(BTreeMap<String, Wire>),
    Circular,
    Truncated,
}

/// Finite numbers travel as JSON numbers, the rest as their names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumRepr {
    Finite(f64),
    Special(String),
}

impl NumRepr {
    fn from_f64(n: f64) -> Self {
        if n.is_nan() {
            NumRepr::Special("NaN".to_string())
        } else if n.is_infinite() {
            let name = if n > 0.0 { "Infinity" } else { "-Infinity" };
            NumRepr::Special(name.to_string())
        } else if n == 0.0 && n.is_sign_negative() {
            NumRepr::Special("-0".to_string())
        } else {
            NumRepr::Finite(n)
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            NumRepr::Finite(n) => *n,
            NumRepr::Special(name) => special_number(name).unwrap_or(f64::NAN),
        }
    }
}

fn first_opaque(value: &ScriptValue) -> Option<&ScriptValue> {
    match value {
        ScriptValue::Function(_) | ScriptValue::Symbol(_) | ScriptValue::Circular | ScriptValue::Truncated => {
            Some(value)
        }
        ScriptValue::Array(items) => items.iter().find_map(first_opaque),
        ScriptValue::Object(map) => map.values().find_map(first_opaque),
        _ => None,
    }
}

impl Wire {
    /// Encode a host value for the realm. Opaque values (functions, symbols,
    /// cycle markers) have no meaning on the way in and are rejected.
    pub fn encode(value: &ScriptValue) -> Result<Wire> {
        if let Some(opaque) = first_opaque(value) {
            bail!("a {} value cannot be passed into the sandbox", opaque.type_name());
        }
        Ok(Wire::capture(value))
    }

    /// Lossless encoding of any value, opaque markers included
    pub fn capture(value: &ScriptValue) -> Wire {
        match value {
            ScriptValue::Undefined => Wire::Undefined,
            ScriptValue::Null => Wire::Null,
            ScriptValue::Bool(b) => Wire::Bool(*b),
            ScriptValue::Number(n) => Wire::Num(NumRepr::from_f64(*n)),
            ScriptValue::BigInt(digits) => Wire::Bigint(digits.clone()),
            ScriptValue::String(s) => Wire::Str(s.clone()),
            ScriptValue::Array(items) => Wire::Array(items.iter().map(Wire::capture).collect()),
            ScriptValue::Object(map) => {
                Wire::Object(map.iter().map(|(k, v)| (k.clone(), Wire::capture(v))).collect())
            }
            ScriptValue::Function(name) => Wire::Function(name.clone()),
            ScriptValue::Symbol(description) => Wire::Symbol(description.clone()),
            ScriptValue::Circular => Wire::Circular,
            ScriptValue::Truncated => Wire::Truncated,
        }
    }

    pub fn decode(self) -> ScriptValue {
        match self {
            Wire::Undefined => ScriptValue::Undefined,
            Wire::Null => ScriptValue::Null,
            Wire::Bool(b) => ScriptValue::Bool(b),
            Wire::Num(n) => ScriptValue::Number(n.to_f64()),
            Wire::Str(s) => ScriptValue::String(s),
            Wire::Bigint(digits) => ScriptValue::BigInt(digits),
            Wire::Symbol(description) => ScriptValue::Symbol(description),
            Wire::Function(name) => ScriptValue::Function(name),
            Wire::Array(items) => ScriptValue::Array(items.into_iter().map(Wire::decode).collect()),
            Wire::Object(map) => {
                ScriptValue::Object(map.into_iter().map(|(k, v)| (k, v.decode())).collect())
            }
            Wire::Circular => ScriptValue::Circular,
            Wire::Truncated => ScriptValue::Truncated,
        }
    }
}

/// Encode an argument list as the JSON text `invoke` expects
pub fn encode_args(args: &[ScriptValue]) -> Result<String> {
    let wire = args
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            Wire::encode(arg).map_err(|e| RequestError::UntransferableArgument {
                index,
                reason: e.to_string(),
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    serde_json::to_string(&wire).context("Failed to serialize arguments")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreludeOptions<'a> {
    allowed: Vec<&'a str>,
    namespaces: &'static [&'static str],
    capabilities: &'a codelab_common::types::Capabilities,
    fixtures: PreludeFixtures<'a>,
    max_console_entries: usize,
    max_depth: usize,
    max_nesting: usize,
    seed: u32,
    freeze: bool,
}

/// Fixtures as `[key, value]` pairs so keys never become object properties
#[derive(Serialize)]
struct PreludeFixtures<'a> {
    network: Vec<(&'a str, &'a str)>,
    files: Vec<(&'a str, &'a str)>,
}

/// Script text that locks down a fresh realm and evaluates to the harness
/// object (`invoke`, `drain`)
pub fn prelude(env: &Environment) -> Result<String> {
    let limits = env.limits();
    let fixtures = env.fixtures();
    let options = PreludeOptions {
        allowed: env.names().collect(),
        namespaces: Environment::namespaces(),
        capabilities: env.capabilities(),
        fixtures: PreludeFixtures {
            network: fixtures.network.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            files: fixtures.files.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        },
        max_console_entries: limits.max_console_entries,
        max_depth: limits.max_value_depth,
        max_nesting: limits.max_nesting_depth,
        seed: limits.random_seed,
        freeze: limits.freeze_intrinsics,
    };
    let options_json = serde_json::to_string(&options).context("Failed to serialize prelude options")?;
    Ok(format!("{}(globalThis, {});", PRELUDE.trim_end(), options_json))
}

#[derive(Debug, Serialize, Deserialize)]
struct RawConsoleEntry {
    level: ConsoleLevel,
    values: Vec<Wire>,
    seq: u64,
}

#[derive(Debug, Deserialize)]
struct RawError {
    name: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    status: String,
    #[serde(default)]
    value: Option<Wire>,
    #[serde(default)]
    error: Option<RawError>,
    console: Vec<RawConsoleEntry>,
    dropped: u64,
}

/// Console in wire form: what `drain` returns, and what a worker process
/// sends back to the host
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WireConsole {
    console: Vec<RawConsoleEntry>,
    dropped: u64,
}

impl WireConsole {
    pub fn capture(captured: &CapturedConsole) -> Self {
        Self {
            console: captured
                .entries
                .iter()
                .map(|entry| RawConsoleEntry {
                    level: entry.level,
                    values: entry.values.iter().map(Wire::capture).collect(),
                    seq: entry.sequence,
                })
                .collect(),
            dropped: captured.dropped,
        }
    }

    pub fn into_captured(self) -> CapturedConsole {
        convert_console(self.console, self.dropped)
    }
}

/// Console captured in one realm
#[derive(Debug, Default)]
pub struct CapturedConsole {
    pub entries: Vec<ConsoleEntry>,
    pub dropped: u64,
}

/// What `invoke` reported
#[derive(Debug)]
pub enum Report {
    Returned(ScriptValue),
    Threw(ScriptError),
}

fn convert_console(raw: Vec<RawConsoleEntry>, dropped: u64) -> CapturedConsole {
    CapturedConsole {
        entries: raw
            .into_iter()
            .map(|entry| ConsoleEntry {
                level: entry.level,
                values: entry.values.into_iter().map(Wire::decode).collect(),
                sequence: entry.seq,
            })
            .collect(),
        dropped,
    }
}

/// Parse the JSON text returned by `invoke`
pub fn parse_report(text: &str) -> Result<(Report, CapturedConsole)> {
    let raw: RawReport = serde_json::from_str(text).context("Malformed harness report")?;
    let console = convert_console(raw.console, raw.dropped);
    let report = match raw.status.as_str() {
        "ok" => Report::Returned(raw.value.map(Wire::decode).unwrap_or(ScriptValue::Undefined)),
        "error" => {
            let error = raw.error.context("Harness error report without error")?;
            Report::Threw(match error.name {
                Some(name) => ScriptError::thrown(name, error.message),
                None => ScriptError::opaque(error.message),
            })
        }
        "internal" => {
            let message = raw.error.map(|e| e.message).unwrap_or_default();
            bail!("Harness internal failure: {}", message)
        }
        other => bail!("Unknown harness report status: {}", other),
    };
    Ok((report, console))
}

/// Parse the JSON text returned by `drain`
pub fn parse_drain(text: &str) -> Result<CapturedConsole> {
    let raw: WireConsole = serde_json::from_str(text).context("Malformed console drain")?;
    Ok(raw.into_captured())
}
