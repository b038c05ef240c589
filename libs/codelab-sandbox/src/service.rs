//! Programmatic surface of the sandbox: the one type the HTTP API, the CLI
//! and any embedding caller talk to.

use crate::analyzer::StaticAnalyzer;
use crate::cancel::CancellationToken;
use crate::classifier;
use crate::engine::SandboxEngine;
use crate::environment::EnvironmentBuilder;
use crate::orchestrator::{SuiteHandle, TestOrchestrator};
use crate::worker::WorkerCommand;
use anyhow::Result;
use codelab_common::config::SandboxConfig;
use codelab_common::types::{
    CodeSnippet, ErrorClassification, ExecutionOptions, ExecutionRequest, ExecutionResult, ScriptError,
    SuiteSummary, TestCase, TestResult, TestSuite, ValidationReport,
};
use codelab_common::value::ScriptValue;
use std::sync::Arc;

#[derive(Clone)]
pub struct Harness {
    config: Arc<SandboxConfig>,
    analyzer: StaticAnalyzer,
    engine: Arc<SandboxEngine>,
}

impl Harness {
    pub fn new(config: SandboxConfig) -> Self {
        let engine = Arc::new(SandboxEngine::new(&config));
        Self {
            analyzer: StaticAnalyzer::new(&config),
            config: Arc::new(config),
            engine,
        }
    }

    /// Run every realm in a worker process. Call before the harness is
    /// cloned; clones made earlier keep the in-process engine.
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.engine = Arc::new(SandboxEngine::new(&self.config).with_worker(worker));
        self
    }

    /// Harness over `SandboxConfig::load_default()`
    pub fn from_default_config() -> Result<Self> {
        Ok(Self::new(SandboxConfig::load_default()?))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn abandoned_executions(&self) -> usize {
        self.engine.abandoned_executions()
    }

    pub fn validate(&self, source: &str) -> ValidationReport {
        self.analyzer.validate(source)
    }

    pub fn validate_with(&self, source: &str, options: &ExecutionOptions) -> ValidationReport {
        self.analyzer.validate_with(source, &options.capabilities)
    }

    /// Ad hoc run (playground). Timeout defaults from configuration and is
    /// clamped to the configured maximum.
    pub async fn execute(
        &self,
        source: impl Into<String>,
        args: Vec<ScriptValue>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let mut snippet = CodeSnippet::new(source);
        snippet.entry_point = options.entry_point;
        let timeout = self.config.effective_timeout(options.timeout_ms);
        let env = EnvironmentBuilder::new(&self.config)
            .with_fixtures(options.fixtures)
            .build(options.capabilities);
        let request = ExecutionRequest::new(snippet, args, timeout).with_capabilities(options.capabilities);
        self.engine.execute(request, env).await
    }

    fn orchestrator_for(&self, suite: Option<&TestSuite>) -> TestOrchestrator {
        let orchestrator = TestOrchestrator::new(self.engine.clone(), self.config.clone());
        match suite {
            Some(suite) => orchestrator
                .with_capabilities(suite.capabilities)
                .with_fixtures(suite.fixtures.clone()),
            None => orchestrator,
        }
    }

    pub async fn run_test(&self, snippet: &CodeSnippet, test: &TestCase) -> TestResult {
        self.orchestrator_for(None).run_test(snippet, test).await
    }

    /// Start a suite. The suite's entry point applies when the snippet names
    /// none of its own.
    pub fn start_suite(&self, mut snippet: CodeSnippet, suite: TestSuite, cancel: CancellationToken) -> SuiteHandle {
        if snippet.entry_point.is_none() {
            snippet.entry_point = suite.entry_point.clone();
        }
        let orchestrator = self.orchestrator_for(Some(&suite));
        orchestrator.start_suite(snippet, suite.tests, cancel)
    }

    pub async fn run_suite(&self, snippet: CodeSnippet, suite: TestSuite, cancel: CancellationToken) -> Result<SuiteSummary> {
        self.start_suite(snippet, suite, cancel).finish().await
    }

    pub fn classify_error(&self, error: &ScriptError) -> ErrorClassification {
        classifier::classify(error)
    }
}
