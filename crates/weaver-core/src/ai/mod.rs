//! AI provider layer
//!
//! Provider-agnostic message types, the streaming provider capability the
//! agent loop consumes, and retry with backoff for transient provider errors.

pub mod provider;
pub mod retry;
pub mod types;

pub use provider::{LlmProvider, StreamPart};
