//! Streaming LLM provider capability
//!
//! The concrete wire format lives behind `LlmProvider`; the agent loop only
//! sees a channel of `StreamPart`s for each request.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{AiTool, AiToolCall, FinishReason, ModelMessage, Usage};
use crate::error::ProviderError;

/// One element of a provider response stream
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta { delta: String },
    ThinkingDelta { thinking: String },
    /// A tool call has started streaming; arguments are not complete yet
    ToolCallStart { id: String, name: String },
    /// Tool call arguments fully received
    ToolCallComplete { tool_call: AiToolCall },
    Usage { usage: Usage },
    Finish { reason: FinishReason },
    /// Mid-stream failure; ends the response
    Error { error: ProviderError },
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a streaming chat request.
    ///
    /// Errors returned here happened before any part was produced. The
    /// returned channel closes once the response is complete.
    async fn stream_chat(
        &self,
        messages: Vec<ModelMessage>,
        tools: Vec<AiTool>,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, ProviderError>;
}
