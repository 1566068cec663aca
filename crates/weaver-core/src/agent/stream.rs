//! Stream processing for the agent loop.
//!
//! Consumes `StreamPart`s from the provider and:
//! - Accumulates text and completed tool calls
//! - Publishes text/thinking deltas live
//! - Fails on provider errors, stalls, and cancellation

use std::time::Duration;

use tokio::sync::mpsc;

use super::cancellation::AgentCancellation;
use super::loop_events::{AgentEmitter, AgentEvent};
use crate::ai::provider::StreamPart;
use crate::ai::types::{AiToolCall, FinishReason, Usage};
use crate::error::{AgentError, ProviderError};

/// Result of processing a complete model stream.
#[derive(Debug, Default)]
pub(crate) struct StreamResult {
    pub text: String,
    pub tool_calls: Vec<AiToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}

/// Drain one model response.
///
/// A stream that produces nothing for `idle_timeout` counts as a transient
/// provider failure.
pub(crate) async fn process_stream(
    mut rx: mpsc::UnboundedReceiver<StreamPart>,
    emitter: &AgentEmitter,
    cancellation: &AgentCancellation,
    idle_timeout: Duration,
) -> Result<StreamResult, AgentError> {
    let mut result = StreamResult::default();

    loop {
        let part = tokio::select! {
            _ = cancellation.cancelled() => return Err(AgentError::Cancelled),
            next = tokio::time::timeout(idle_timeout, rx.recv()) => match next {
                Ok(Some(part)) => part,
                Ok(None) => break,
                Err(_) => {
                    return Err(ProviderError::transient(format!(
                        "model stream stalled: no data for {} seconds",
                        idle_timeout.as_secs()
                    ))
                    .into());
                }
            },
        };

        match part {
            StreamPart::TextDelta { delta } => {
                result.text.push_str(&delta);
                emitter.emit(AgentEvent::Delta { delta });
            }
            StreamPart::ThinkingDelta { thinking } => {
                emitter.emit(AgentEvent::Thinking { thinking });
            }
            StreamPart::ToolCallStart { id, name } => {
                tracing::trace!(tool_call_id = %id, tool = %name, "Tool call streaming");
            }
            StreamPart::ToolCallComplete { tool_call } => {
                result.tool_calls.push(tool_call);
            }
            StreamPart::Usage { usage } => {
                result.usage.add(&usage);
            }
            StreamPart::Finish { reason } => {
                result.finish_reason = Some(reason);
            }
            StreamPart::Error { error } => return Err(error.into()),
        }
    }

    Ok(result)
}
