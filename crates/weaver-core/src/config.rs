//! Engine configuration
//!
//! Every threshold the engine uses (iteration ceilings, retry budgets,
//! timeouts, queue sizes) is injected through `WeaverConfig`. The file lives
//! at `~/.weaver/config.toml`; every field is optional and falls back to the
//! values in `constants`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ai::retry::RetryConfig;
use crate::constants;
use crate::paths;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    /// Database file; defaults to `~/.weaver/weaver.db`
    pub db_path: Option<PathBuf>,
    pub agent: AgentSettings,
    pub provider_retry: RetryConfig,
    pub executor: ExecutorSettings,
    pub events: EventSettings,
    pub server: ServerSettings,
}

impl WeaverConfig {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        let path = paths::config_file();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default().with_env_overrides());
        }
        Self::load_from(&path).map(Self::with_env_overrides)
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `WEAVER_DB_PATH` / `WEAVER_PORT` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(db_path) = std::env::var("WEAVER_DB_PATH") {
            if !db_path.is_empty() {
                self.db_path = Some(PathBuf::from(db_path));
            }
        }
        if let Ok(port) = std::env::var("WEAVER_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid WEAVER_PORT"),
            }
        }
        self
    }

    /// Resolved database path
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(paths::default_db_path)
    }
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub context_token_budget: usize,
    pub max_overflow_retries: usize,
    pub max_tool_output_chars: usize,
    pub tool_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub repeated_failure_threshold: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: constants::agent::MAX_ITERATIONS,
            context_token_budget: constants::agent::CONTEXT_TOKEN_BUDGET,
            max_overflow_retries: constants::agent::MAX_OVERFLOW_RETRIES,
            max_tool_output_chars: constants::agent::MAX_TOOL_OUTPUT_CHARS,
            tool_timeout_secs: constants::agent::TOOL_TIMEOUT_SECS,
            stream_idle_timeout_secs: constants::agent::STREAM_IDLE_TIMEOUT_SECS,
            repeated_failure_threshold: constants::agent::REPEATED_FAILURE_THRESHOLD,
        }
    }
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Task executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Worker pool size
    pub max_workers: usize,
    /// Attempt ceiling applied to tasks created without an explicit one
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub task_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_workers: constants::executor::MAX_WORKERS,
            max_retries: constants::executor::MAX_RETRIES,
            retry_base_delay_ms: constants::executor::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: constants::executor::RETRY_MAX_DELAY_MS,
            task_timeout_secs: constants::executor::TASK_TIMEOUT_SECS,
            sweep_interval_ms: constants::executor::SWEEP_INTERVAL_MS,
        }
    }
}

impl ExecutorSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Per-subscriber live queue size
    pub subscriber_capacity: usize,
    /// Consecutive store failures before an operator alert is logged
    pub store_failure_alert_threshold: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: constants::events::SUBSCRIBER_CAPACITY,
            store_failure_alert_threshold: constants::events::STORE_FAILURE_ALERT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: constants::server::DEFAULT_PORT,
        }
    }
}
