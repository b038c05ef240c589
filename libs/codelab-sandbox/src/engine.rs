/// Execution Engine - Runs One Snippet Against One Argument List
///
/// **Core Responsibility:**
/// Evaluate a snippet in a fresh interpreter realm, capture its console, and
/// race completion against the request timeout.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (realm, thread or worker process, limits)
/// - Engine does NOT compare results or score tests
/// - Engine returns a single tagged outcome for the evaluator to judge
///
/// **Timeout model:**
/// With a worker command configured, every execution runs in its own child
/// process. When the timer wins the worker is killed, and a native stack
/// overflow ends only the worker.
///
/// Without one, the realm runs on an OS thread in this process. A thread
/// cannot be killed, so when the timer wins the thread is abandoned: the
/// caller gets `Timeout` immediately while the realm keeps running until its
/// loop budget stops it. The thread holds a concurrency permit until it
/// exits, which caps the number of live interpreter threads.
///
/// Loop budget exhaustion is reported as a `RangeError`, never as `Timeout`,
/// so `Timeout` always means the wall-clock timeout elapsed.

use crate::analyzer::StaticAnalyzer;
use crate::environment::Environment;
use crate::harness::CapturedConsole;
use crate::realm::{self, RealmJob, RealmOutcome, RequestError};
use crate::worker::{self, WorkerCommand, WorkerRequest};
use anyhow::{bail, Context, Result};
use codelab_common::config::SandboxConfig;
use codelab_common::types::{
    ExecutionOutcome, ExecutionRequest, ExecutionResult, RiskSeverity,
};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on the encoded argument payload
const MAX_ARGS_BYTES: usize = 1024 * 1024;

const SLOT_RUNNING: u8 = 0;
const SLOT_DONE: u8 = 1;
const SLOT_ABANDONED: u8 = 2;

/// Execution slot guard - owns the concurrency permit for the lifetime of the
/// interpreter thread and settles abandonment bookkeeping on drop, including
/// when the thread unwinds.
struct ExecutionSlot {
    state: Arc<AtomicU8>,
    abandoned: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if self.state.swap(SLOT_DONE, Ordering::AcqRel) == SLOT_ABANDONED {
            self.abandoned.fetch_sub(1, Ordering::AcqRel);
            debug!("Abandoned interpreter thread finished");
        }
    }
}

/// Where realms run
#[derive(Debug, Clone)]
enum Isolation {
    Thread,
    Process(WorkerCommand),
}

/// Who won the race against the timer
enum Race {
    Finished(RealmOutcome),
    TimedOut { abandoned: bool },
}

/// Realm-based engine. Cheap to share behind an `Arc`; holds no per-request
/// state.
pub struct SandboxEngine {
    analyzer: StaticAnalyzer,
    permits: Arc<Semaphore>,
    abandoned: Arc<AtomicUsize>,
    thread_stack_bytes: usize,
    isolation: Isolation,
}

impl SandboxEngine {
    /// In-process engine: realms run on threads of this process
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            analyzer: StaticAnalyzer::new(config),
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            abandoned: Arc::new(AtomicUsize::new(0)),
            thread_stack_bytes: config.thread_stack_bytes,
            isolation: Isolation::Thread,
        }
    }

    /// Run every realm in a worker process started by `worker`
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.isolation = Isolation::Process(worker);
        self
    }

    pub fn is_process_isolated(&self) -> bool {
        matches!(self.isolation, Isolation::Process(_))
    }

    /// Interpreter threads left running after their request timed out
    pub fn abandoned_executions(&self) -> usize {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Execute one request against its environment.
    ///
    /// Script failures, timeouts and validation rejections are data in the
    /// returned result. `Err` is reserved for malformed requests
    /// (`RequestError`) and engine-internal failures.
    #[tracing::instrument(skip(self, request, env), fields(execution_id = %request.id))]
    pub async fn execute(&self, request: ExecutionRequest, env: Environment) -> Result<ExecutionResult> {
        let ExecutionRequest {
            id,
            snippet,
            args,
            timeout,
            capabilities,
        } = request;

        // GUARDRAIL 1: static analysis short-circuits before any realm exists
        let findings = self.analyzer.analyze_with(&snippet.source, &capabilities);
        if findings.iter().any(|f| f.severity == RiskSeverity::Error) {
            info!(findings = findings.len(), "Snippet rejected by static analysis");
            return Ok(ExecutionResult {
                execution_id: id,
                outcome: ExecutionOutcome::ValidationRejected { findings },
                elapsed: Duration::ZERO,
            });
        }

        // GUARDRAIL 2: bounded argument payload
        let job = RealmJob::new(snippet.source, snippet.entry_point, &args, &env)?;
        if job.args_json.len() > MAX_ARGS_BYTES {
            return Err(RequestError::ArgumentsTooLarge { limit: MAX_ARGS_BYTES }.into());
        }
        drop(env);

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Execution semaphore closed")?;

        // Timer starts once a slot is held; queueing is not execution time
        let start_time = Instant::now();
        let race = match &self.isolation {
            Isolation::Thread => self.run_on_thread(id, job, permit, timeout).await?,
            Isolation::Process(command) => {
                let race = self.run_in_worker(command, job, timeout).await;
                drop(permit);
                race?
            }
        };
        let elapsed = start_time.elapsed();

        let outcome = match race {
            Race::TimedOut { abandoned } => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    elapsed_ms = elapsed.as_millis() as u64,
                    abandoned,
                    "Execution timed out"
                );
                return Ok(ExecutionResult {
                    execution_id: id,
                    outcome: ExecutionOutcome::Timeout { abandoned },
                    elapsed,
                });
            }
            Race::Finished(RealmOutcome::Returned { value, console }) => {
                log_dropped(&console);
                ExecutionOutcome::Success {
                    value,
                    console: console.entries,
                }
            }
            Race::Finished(RealmOutcome::Threw { error, console }) => {
                log_dropped(&console);
                ExecutionOutcome::RuntimeError {
                    error,
                    console: console.entries,
                }
            }
        };

        let result = ExecutionResult {
            execution_id: id,
            outcome,
            elapsed,
        };
        info!(
            outcome = result.outcome_label(),
            elapsed_ms = result.elapsed_ms(),
            "Execution finished"
        );
        Ok(result)
    }

    async fn run_on_thread(
        &self,
        id: Uuid,
        job: RealmJob,
        permit: OwnedSemaphorePermit,
        timeout: Duration,
    ) -> Result<Race> {
        let state = Arc::new(AtomicU8::new(SLOT_RUNNING));
        let slot = ExecutionSlot {
            state: state.clone(),
            abandoned: self.abandoned.clone(),
            _permit: permit,
        };

        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("codelab-realm-{}", id))
            .stack_size(self.thread_stack_bytes)
            .spawn(move || {
                let _slot = slot;
                let outcome = realm::evaluate(job);
                // Receiver is gone when the request already timed out
                let _ = tx.send(outcome);
            })
            .context("Failed to spawn interpreter thread")?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(Race::Finished(outcome?)),
            Ok(Err(_)) => bail!("Interpreter thread terminated without a result"),
            Err(_) => {
                // TIMEOUT: count first so the thread's drop never underflows
                self.abandoned.fetch_add(1, Ordering::AcqRel);
                let abandoned = state
                    .compare_exchange(SLOT_RUNNING, SLOT_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if !abandoned {
                    self.abandoned.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(Race::TimedOut { abandoned })
            }
        }
    }

    async fn run_in_worker(&self, command: &WorkerCommand, job: RealmJob, timeout: Duration) -> Result<Race> {
        let request = serde_json::to_vec(&WorkerRequest {
            thread_stack_bytes: self.thread_stack_bytes,
            job,
        })
        .context("Failed to serialize worker request")?;

        let mut child = command
            .command()
            .spawn()
            .with_context(|| format!("Failed to spawn realm worker {}", command.program.display()))?;
        let mut stdin = child.stdin.take().context("Realm worker has no stdin")?;

        let run = async move {
            // A worker that dies early closes the pipe; its exit status says why
            if let Err(e) = stdin.write_all(&request).await {
                debug!(error = %e, "Realm worker stopped reading its request");
            }
            drop(stdin);
            child.wait_with_output().await
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(output) => {
                let output = output.context("Failed to collect realm worker output")?;
                Ok(Race::Finished(worker::read_output(output)?))
            }
            // The child handle was dropped with the future; kill_on_drop ends it
            Err(_) => Ok(Race::TimedOut { abandoned: false }),
        }
    }
}

fn log_dropped(console: &CapturedConsole) {
    if console.dropped > 0 {
        warn!(dropped = console.dropped, "Console entries over the limit were dropped");
    }
}
