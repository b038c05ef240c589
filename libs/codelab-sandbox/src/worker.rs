/// Realm Worker - One Interpreter Realm Per Child Process
///
/// **Protocol:**
/// The host writes one `WorkerRequest` (JSON) to the worker's stdin and closes
/// it. The worker evaluates the job on a large-stack thread and writes one
/// `WorkerReport` (JSON) to stdout, then exits 0.
///
/// **Failure model:**
/// The interpreter's parser and its JSON built-ins recurse on the native
/// stack, and a Rust stack overflow aborts the whole process. Inside a worker
/// that abort only ends the worker; the host reads the exit status and turns
/// it into a snippet-caused `RangeError`. On timeout the host drops the child
/// handle, which kills the worker, so no interpreter outlives its request.

use crate::harness::{Wire, WireConsole};
use crate::realm::{self, RealmJob, RealmOutcome};
use anyhow::{anyhow, bail, Context, Result};
use codelab_common::types::ScriptError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Output, Stdio};

/// First argument that switches a host binary into worker mode
pub const WORKER_ARG: &str = "realm-worker";

const STACK_OVERFLOW_MARKER: &str = "has overflowed its stack";

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// A dedicated worker executable, e.g. `codelab-realm`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-exec the running binary with `WORKER_ARG`. The binary must call
    /// `run_if_requested` before it writes anything to stdout.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self {
            program,
            args: vec![WORKER_ARG.to_string()],
        })
    }

    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WorkerRequest {
    pub thread_stack_bytes: usize,
    pub job: RealmJob,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WorkerReport {
    Returned { value: Wire, console: WireConsole },
    Threw { error: ScriptError, console: WireConsole },
    Failed { message: String },
}

impl From<Result<RealmOutcome>> for WorkerReport {
    fn from(outcome: Result<RealmOutcome>) -> Self {
        match outcome {
            Ok(RealmOutcome::Returned { value, console }) => WorkerReport::Returned {
                value: Wire::capture(&value),
                console: WireConsole::capture(&console),
            },
            Ok(RealmOutcome::Threw { error, console }) => WorkerReport::Threw {
                error,
                console: WireConsole::capture(&console),
            },
            Err(e) => WorkerReport::Failed {
                message: format!("{:#}", e),
            },
        }
    }
}

fn evaluate_on_thread(request: WorkerRequest) -> Result<RealmOutcome> {
    let WorkerRequest { thread_stack_bytes, job } = request;
    let handle = std::thread::Builder::new()
        .name("codelab-realm".to_string())
        .stack_size(thread_stack_bytes)
        .spawn(move || realm::evaluate(job))
        .context("Failed to spawn interpreter thread")?;
    handle
        .join()
        .map_err(|_| anyhow!("Interpreter thread panicked"))?
}

/// Serve one job over stdin/stdout. Blocking.
pub fn serve_stdio() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read worker request")?;
    let request: WorkerRequest = serde_json::from_str(&input).context("Malformed worker request")?;

    let report = WorkerReport::from(evaluate_on_thread(request));
    let text = serde_json::to_string(&report).context("Failed to serialize worker report")?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes()).context("Failed to write worker report")?;
    stdout.flush().context("Failed to flush worker report")?;
    Ok(())
}

/// Serve one job and exit when this process was started as a realm worker;
/// return otherwise.
pub fn run_if_requested() {
    if std::env::args().nth(1).as_deref() != Some(WORKER_ARG) {
        return;
    }
    let code = match serve_stdio() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("realm worker: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

/// Turn a finished worker's output into the realm outcome. Abnormal exits
/// caused by the snippet become script errors; broken protocol is `Err`.
pub(crate) fn read_output(output: Output) -> Result<RealmOutcome> {
    if output.status.success() {
        let report: WorkerReport =
            serde_json::from_slice(&output.stdout).context("Malformed worker report")?;
        return match report {
            WorkerReport::Returned { value, console } => Ok(RealmOutcome::Returned {
                value: value.decode(),
                console: console.into_captured(),
            }),
            WorkerReport::Threw { error, console } => Ok(RealmOutcome::Threw {
                error,
                console: console.into_captured(),
            }),
            WorkerReport::Failed { message } => bail!("{}", message),
        };
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains(STACK_OVERFLOW_MARKER) {
        return Ok(RealmOutcome::Threw {
            error: ScriptError::thrown(
                "RangeError",
                "Maximum call stack size exceeded (interpreter stack overflow)",
            ),
            console: Default::default(),
        });
    }

    match output.status.code() {
        // Killed by a signal the worker did not raise itself (e.g. OOM)
        None => Ok(RealmOutcome::Threw {
            error: ScriptError::opaque(format!("Interpreter terminated abnormally ({})", output.status)),
            console: Default::default(),
        }),
        Some(code) => bail!(
            "Realm worker exited with code {}: {}",
            code,
            stderr.lines().last().unwrap_or_default()
        ),
    }
}
