//! Engine configuration stored under `.taskpilot/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::completion::{DEFAULT_FAILURE_INDICATORS, DEFAULT_SUCCESS_INDICATORS};
use crate::core::queue::QueuePolicy;
use crate::core::retry::RetryPolicy;

/// What the engine does after a task fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Close the session as halted.
    #[default]
    Halt,
    /// Record the failure and continue with the next unit.
    Skip,
}

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// When false, `start` refuses to run.
    pub enabled: bool,

    /// Parallel dispatches. Only `1` is supported; larger values are clamped.
    pub concurrency: u32,

    pub max_retries: u32,

    /// Upper bound on waiting for one attempt's verdict.
    pub task_timeout_ms: u64,

    /// Pause between consecutive dispatches.
    pub task_delay_ms: u64,

    pub skip_optional_tasks: bool,

    pub excluded_specs: Vec<String>,

    /// `"spec:id"` or bare `"id"`.
    pub excluded_tasks: Vec<String>,

    /// Treat a response that ends without any indicator as a failure.
    pub verify_completion: bool,

    pub max_memory_mb: u64,

    pub max_cpu_percent: f64,

    /// Spec directory, relative to the workspace root.
    pub specs_dir: String,

    /// Specs listed here run first, in this order.
    pub spec_order: Vec<String>,

    pub on_task_failure: FailureMode,

    pub watch_files: bool,

    pub watch_poll_ms: u64,

    /// Context documents are dropped from prompts beyond this size.
    pub prompt_budget_bytes: usize,

    pub retry: RetryConfig,

    pub completion: CompletionConfig,

    pub resources: ResourceConfig,

    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    pub success_indicators: Vec<String>,
    pub failure_indicators: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            success_indicators: DEFAULT_SUCCESS_INDICATORS
                .iter()
                .map(|phrase| (*phrase).to_string())
                .collect(),
            failure_indicators: DEFAULT_FAILURE_INDICATORS
                .iter()
                .map(|phrase| (*phrase).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceConfig {
    pub snapshot_interval_ms: u64,
    pub max_task_duration_ms: u64,
    /// Consecutive snapshots inspected by leak detection.
    pub leak_window: usize,
    /// Growth across the window (MB) that counts as a suspected leak.
    pub leak_growth_mb: u64,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    pub cache_ttl_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 5_000,
            max_task_duration_ms: 15 * 60 * 1_000,
            leak_window: 6,
            leak_growth_mb: 64,
            cache_max_entries: 64,
            cache_max_bytes: 8 * 1024 * 1024,
            cache_ttl_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssistantConfig {
    /// Command the CLI pipes each prompt into (e.g. `["claude","-p"]`).
    pub command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 1,
            max_retries: 3,
            task_timeout_ms: 10 * 60 * 1_000,
            task_delay_ms: 2_000,
            skip_optional_tasks: false,
            excluded_specs: Vec::new(),
            excluded_tasks: Vec::new(),
            verify_completion: true,
            max_memory_mb: 1_024,
            max_cpu_percent: 90.0,
            specs_dir: ".kiro/specs".to_string(),
            spec_order: Vec::new(),
            on_task_failure: FailureMode::Halt,
            watch_files: true,
            watch_poll_ms: 500,
            prompt_budget_bytes: 200_000,
            retry: RetryConfig::default(),
            completion: CompletionConfig::default(),
            resources: ResourceConfig::default(),
            assistant: AssistantConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be >= 1"));
        }
        if self.task_timeout_ms == 0 {
            return Err(anyhow!("task_timeout_ms must be > 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms must be <= retry.max_delay_ms"));
        }
        if !self.max_cpu_percent.is_finite() || self.max_cpu_percent <= 0.0 {
            return Err(anyhow!("max_cpu_percent must be a positive number"));
        }
        if self.max_memory_mb == 0 {
            return Err(anyhow!("max_memory_mb must be > 0"));
        }
        if self.specs_dir.trim().is_empty() {
            return Err(anyhow!("specs_dir must be non-empty"));
        }
        if self.watch_files && self.watch_poll_ms == 0 {
            return Err(anyhow!("watch_poll_ms must be > 0 when watch_files is set"));
        }
        if self.resources.snapshot_interval_ms == 0 {
            return Err(anyhow!("resources.snapshot_interval_ms must be > 0"));
        }
        if self.resources.leak_window < 2 {
            return Err(anyhow!("resources.leak_window must be >= 2"));
        }
        if self.resources.cache_max_entries == 0 || self.resources.cache_max_bytes == 0 {
            return Err(anyhow!("resources cache ceilings must be > 0"));
        }
        if self
            .assistant
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("assistant.command must start with a program"));
        }
        Ok(())
    }

    /// Parallelism actually used. Values above 1 are reserved.
    pub fn effective_concurrency(&self) -> u32 {
        if self.concurrency > 1 {
            warn!(
                configured = self.concurrency,
                "concurrency > 1 is not supported; running one task at a time"
            );
        }
        1
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy<'_> {
        QueuePolicy {
            spec_order: &self.spec_order,
            excluded_specs: &self.excluded_specs,
            excluded_tasks: &self.excluded_tasks,
            skip_optional: self.skip_optional_tasks,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn task_delay(&self) -> Duration {
        Duration::from_millis(self.task_delay_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let cfg = EngineConfig {
            max_retries: 5,
            excluded_tasks: vec!["auth:2.1".to_string()],
            on_task_failure: FailureMode::Skip,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_retries = 2\non_task_failure = \"skip\"\n\n[retry]\nbase_delay_ms = 10\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.on_task_failure, FailureMode::Skip);
        assert_eq!(cfg.retry.base_delay_ms, 10);
        assert_eq!(cfg.retry.max_delay_ms, RetryConfig::default().max_delay_ms);
        assert_eq!(cfg.specs_dir, ".kiro/specs");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn concurrency_above_one_is_clamped() {
        let cfg = EngineConfig {
            concurrency: 4,
            ..EngineConfig::default()
        };
        cfg.validate().expect("valid");
        assert_eq!(cfg.effective_concurrency(), 1);
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let cfg = EngineConfig {
            retry: RetryConfig {
                base_delay_ms: 5_000,
                max_delay_ms: 1_000,
            },
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("base_delay_ms"));
    }

    #[test]
    fn retry_policy_reflects_config() {
        let cfg = EngineConfig {
            max_retries: 2,
            ..EngineConfig::default()
        };
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }
}
