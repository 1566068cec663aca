//! Domain error taxonomy
//!
//! The agent loop classifies every failure into an `AgentError` before it
//! reaches the task executor, which only asks `is_retryable()` to decide
//! between another attempt and a terminal failure.

use std::time::Duration;

use thiserror::Error;

use crate::ai::retry::IsRetryable;

/// How a provider failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Rate limits, 5xx, dropped connections
    Transient,
    /// Bad request, auth, unknown model
    Permanent,
    /// Request exceeded the model's context window
    ContextOverflow,
}

/// Failure reported by an LLM provider
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            kind: ProviderErrorKind::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            kind: ProviderErrorKind::Permanent,
        }
    }

    pub fn context_overflow(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            kind: ProviderErrorKind::ContextOverflow,
        }
    }

    /// Classify by HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if crate::ai::retry::is_retryable_status(status) {
            ProviderErrorKind::Transient
        } else if status == 413 {
            ProviderErrorKind::ContextOverflow
        } else {
            ProviderErrorKind::Permanent
        };
        Self {
            message: message.into(),
            status: Some(status),
            retry_after: None,
            kind,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    pub fn is_context_overflow(&self) -> bool {
        self.kind == ProviderErrorKind::ContextOverflow
    }
}

impl IsRetryable for ProviderError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Terminal outcome of one agent loop invocation that did not succeed
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("context overflow: {required} tokens required, budget is {budget}")]
    ContextOverflow { required: usize, budget: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out: {reason}")]
    Timeout { reason: String },

    #[error("exceeded {max} iterations")]
    MaxIterationsExceeded { max: usize },
}

impl AgentError {
    /// Stable machine-readable kind, used in event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider_error",
            Self::ToolExecution { .. } => "tool_execution_error",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
        }
    }

    /// Whether the task executor may schedule another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::ToolExecution { .. } | Self::MaxIterationsExceeded { .. } => true,
            Self::Timeout { .. } => true,
            Self::ContextOverflow { .. } | Self::Cancelled => false,
        }
    }
}

impl IsRetryable for AgentError {
    fn is_retryable(&self) -> bool {
        AgentError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(e) => e.retry_after,
            _ => None,
        }
    }
}

/// Rejected task executor operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot {action} task {task_id} while it is {from}")]
    InvalidTransition {
        task_id: String,
        from: String,
        action: &'static str,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("plan {0} is already running")]
    AlreadyRunning(String),
}

/// Rejected run coordinator operation
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("run {run_id} is {status}, cannot {action}")]
    InvalidState {
        run_id: String,
        status: String,
        action: &'static str,
    },

    #[error("run {0} is not waiting for input")]
    NoPendingInput(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
