//! Weaver core
//!
//! Agent execution and event-streaming engine:
//! - `agent` - the tool-calling agent loop and its task runner
//! - `plan` - plans, tasks, and the dependency-aware task executor
//! - `run` - the run coordinator and the user-input gate
//! - `events` - the live event bus and the persisted event vocabulary
//! - `storage` - SQLite event log and plan records
//! - `tools` - tool capability set and registry
//! - `ai` - provider-agnostic LLM types, provider trait, retry

pub mod agent;
pub mod ai;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod paths;
pub mod plan;
pub mod run;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tools;

pub use config::WeaverConfig;
pub use error::{AgentError, ExecutorError, ProviderError, RunError};
