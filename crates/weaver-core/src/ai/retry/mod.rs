//! Rate limiting and retry logic
//!
//! Provides exponential backoff with jitter for handling API rate limits and transient errors.
//!
//! Used by the agent loop around provider stream requests and by the task
//! executor when scheduling another attempt of a failed task.

mod backoff;

pub use backoff::{backoff_delay, is_retryable_status, with_retry, IsRetryable, RetryConfig};
