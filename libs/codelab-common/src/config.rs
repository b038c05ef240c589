// Sandbox configuration: limits, defaults and determinism knobs
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/sandbox.json";
pub const CONFIG_PATH_ENV: &str = "CODELAB_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_source_bytes: usize,
    /// Deepest bracket nesting the analyzer lets through to the parser
    pub max_nesting_depth: usize,
    pub max_concurrent_executions: usize,
    /// Interpreter loop iteration cap; bounds abandoned threads
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub stack_size_limit: usize,
    /// OS stack for each interpreter thread
    pub thread_stack_bytes: usize,
    pub max_console_entries: usize,
    pub max_value_depth: usize,
    pub random_seed: u32,
    pub freeze_intrinsics: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
            max_source_bytes: 64 * 1024,
            max_nesting_depth: 256,
            max_concurrent_executions: 8,
            loop_iteration_limit: 50_000_000,
            recursion_limit: 512,
            stack_size_limit: 10 * 1024,
            thread_stack_bytes: 16 * 1024 * 1024,
            max_console_entries: 1_000,
            max_value_depth: 32,
            random_seed: 0x5eed_1234,
            freeze_intrinsics: true,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Sandbox config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: SandboxConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `CODELAB_CONFIG` or config/sandbox.json, falling back to
    /// built-in defaults when no file exists. Environment overrides apply last.
    pub fn load_default() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::debug!(path = %path.display(), "No sandbox config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = env::var("CODELAB_MAX_CONCURRENCY") {
            self.max_concurrent_executions = raw
                .parse()
                .with_context(|| format!("Invalid CODELAB_MAX_CONCURRENCY: {}", raw))?;
        }
        if let Ok(raw) = env::var("CODELAB_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = raw
                .parse()
                .with_context(|| format!("Invalid CODELAB_DEFAULT_TIMEOUT_MS: {}", raw))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            bail!("default_timeout_ms must be greater than zero");
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            bail!(
                "max_timeout_ms ({}) is below default_timeout_ms ({})",
                self.max_timeout_ms,
                self.default_timeout_ms
            );
        }
        if self.max_source_bytes == 0 {
            bail!("max_source_bytes must be greater than zero");
        }
        if self.max_nesting_depth == 0 {
            bail!("max_nesting_depth must be greater than zero");
        }
        if self.max_concurrent_executions == 0 {
            bail!("max_concurrent_executions must be at least 1");
        }
        if self.loop_iteration_limit == 0 || self.recursion_limit == 0 || self.stack_size_limit == 0 {
            bail!("interpreter limits must be greater than zero");
        }
        if self.thread_stack_bytes < 1024 * 1024 {
            bail!("thread_stack_bytes must be at least 1 MiB");
        }
        if self.max_value_depth == 0 {
            bail!("max_value_depth must be greater than zero");
        }
        Ok(())
    }

    /// Resolve a requested timeout: default when absent, clamped to the max
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SandboxConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_inconsistent_timeouts() {
        let config = SandboxConfig {
            default_timeout_ms: 10_000,
            max_timeout_ms: 1_000,
            ..SandboxConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_timeout_clamps() {
        let config = SandboxConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_millis(5_000));
        assert_eq!(config.effective_timeout(Some(50)), Duration::from_millis(50));
        assert_eq!(config.effective_timeout(Some(600_000)), Duration::from_millis(30_000));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SandboxConfig = serde_json::from_str(r#"{"max_concurrent_executions": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.default_timeout_ms, 5_000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SandboxConfig::load(Path::new("does/not/exist.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
