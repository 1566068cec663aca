//! Centralized constants
//!
//! Defaults for every injected threshold. Runtime values come from
//! `WeaverConfig`; these only seed its defaults.

pub mod files {
    pub const CONFIG_DIR_NAME: &str = ".weaver";
    pub const CONFIG_FILE_NAME: &str = "config.toml";
    pub const DB_FILE_NAME: &str = "weaver.db";
}

pub mod agent {
    /// Iteration ceiling for one agent loop invocation.
    pub const MAX_ITERATIONS: usize = 25;
    /// Estimated-token budget for the conversation sent to the provider.
    pub const CONTEXT_TOKEN_BUDGET: usize = 120_000;
    /// Extra trim-and-retry attempts after a provider context overflow.
    pub const MAX_OVERFLOW_RETRIES: usize = 2;
    pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;
    pub const TOOL_TIMEOUT_SECS: u64 = 120;
    /// Seconds without any stream part before the stream counts as stalled.
    pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 120;
    /// Identical tool failures in a row before the loop gives up.
    pub const REPEATED_FAILURE_THRESHOLD: usize = 3;
}

pub mod retry {
    pub const PROVIDER_MAX_RETRIES: u32 = 3;
    pub const PROVIDER_BASE_DELAY_MS: u64 = 1_000;
    pub const PROVIDER_MAX_DELAY_MS: u64 = 30_000;
}

pub mod executor {
    pub const MAX_WORKERS: usize = 4;
    /// Attempt ceiling per task.
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 2_000;
    pub const RETRY_MAX_DELAY_MS: u64 = 60_000;
    pub const TASK_TIMEOUT_SECS: u64 = 900;
    pub const SWEEP_INTERVAL_MS: u64 = 5_000;
}

pub mod events {
    pub const SUBSCRIBER_CAPACITY: usize = 1_024;
    pub const STORE_FAILURE_ALERT_THRESHOLD: usize = 5;
    /// Attempts at claiming a sequence number before giving up.
    pub const SEQ_CONFLICT_RETRIES: usize = 5;
    pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;
    /// Seconds a session's storage writer waits for work before retiring.
    pub const WRITER_IDLE_SECS: u64 = 60;
}

pub mod server {
    pub const DEFAULT_PORT: u16 = 3000;
}
