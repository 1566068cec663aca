//! The agent loop
//!
//! One invocation drives a single agent's conversation with the model:
//! trim context, stream a response, run the requested tools, feed the
//! results back, and repeat until the model answers without tool calls.
//!
//! Every invocation ends in exactly one of `agent_end` (completed or
//! cancelled) or `agent_error`, carrying the accumulated token usage.

use std::sync::Arc;

use crate::ai::provider::LlmProvider;
use crate::ai::retry::{with_retry, RetryConfig};
use crate::ai::types::{AiTool, ModelMessage, Usage};
use crate::config::AgentSettings;
use crate::error::AgentError;
use crate::events::EventBus;
use crate::run::InputGate;
use crate::tools::{ToolContext, ToolRegistry};

use super::cancellation::AgentCancellation;
use super::context::ConversationContext;
use super::executor::{execute_tools, to_result_content};
use super::failure::FailureTracker;
use super::loop_events::{AgentEmitter, AgentEvent};
use super::stream::{process_stream, StreamResult};
use super::AgentType;

/// Shared dependencies of every agent invocation
#[derive(Clone)]
pub struct AgentServices {
    pub provider: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub bus: EventBus,
}

/// One agent invocation
pub struct AgentRequest {
    pub session_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub agent_type: AgentType,
    pub context: ConversationContext,
    /// Lets interactive tools reach the user through the owning run
    pub input_gate: Option<Arc<InputGate>>,
}

impl AgentRequest {
    pub fn new(
        session_id: impl Into<String>,
        agent_type: AgentType,
        context: ConversationContext,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: uuid::Uuid::new_v4().to_string(),
            task_id: None,
            agent_type,
            context,
            input_gate: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_input_gate(mut self, gate: Option<Arc<InputGate>>) -> Self {
        self.input_gate = gate;
        self
    }
}

/// Successful result of an invocation
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// The model's final answer
    pub text: String,
    pub iterations: usize,
    pub usage: Usage,
    pub context: ConversationContext,
}

#[derive(Default)]
struct Progress {
    iterations: usize,
    usage: Usage,
}

/// Runs agent invocations against one provider and tool set
pub struct AgentLoop {
    services: AgentServices,
    settings: AgentSettings,
    retry: RetryConfig,
}

impl AgentLoop {
    pub fn new(services: AgentServices, settings: AgentSettings, retry: RetryConfig) -> Self {
        Self {
            services,
            settings,
            retry,
        }
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    pub async fn run(
        &self,
        request: AgentRequest,
        cancellation: AgentCancellation,
    ) -> Result<AgentOutcome, AgentError> {
        let AgentRequest {
            session_id,
            agent_id,
            task_id,
            agent_type,
            mut context,
            input_gate,
        } = request;

        let emitter = AgentEmitter::new(
            self.services.bus.clone(),
            session_id.clone(),
            agent_id.clone(),
            task_id.clone(),
        );
        let tool_ctx = ToolContext::new(session_id.clone(), agent_id.clone())
            .with_task(task_id.clone())
            .with_cancellation(cancellation.clone())
            .with_input_gate(input_gate)
            .with_timeout(self.settings.tool_timeout());

        tracing::info!(
            session_id = %session_id,
            agent_id = %agent_id,
            task_id = task_id.as_deref().unwrap_or("-"),
            agent_type = %agent_type,
            "Agent started"
        );
        emitter.emit(AgentEvent::AgentStart { agent_type });

        let mut progress = Progress::default();
        let result = self
            .drive(&mut context, &emitter, &tool_ctx, &cancellation, &mut progress)
            .await;

        match &result {
            Ok(_) => {
                emitter.emit(AgentEvent::AgentEnd {
                    outcome: "completed".to_string(),
                    iterations: progress.iterations,
                    usage: progress.usage,
                });
                tracing::info!(
                    agent_id = %agent_id,
                    iterations = progress.iterations,
                    total_tokens = progress.usage.total_tokens,
                    "Agent completed"
                );
            }
            Err(AgentError::Cancelled) => {
                emitter.emit(AgentEvent::AgentEnd {
                    outcome: "cancelled".to_string(),
                    iterations: progress.iterations,
                    usage: progress.usage,
                });
                tracing::info!(agent_id = %agent_id, "Agent cancelled");
            }
            Err(e) => {
                emitter.emit(AgentEvent::AgentError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    iterations: progress.iterations,
                    usage: progress.usage,
                });
                tracing::warn!(agent_id = %agent_id, error = %e, "Agent failed");
            }
        }

        result.map(|text| AgentOutcome {
            text,
            iterations: progress.iterations,
            usage: progress.usage,
            context,
        })
    }

    async fn drive(
        &self,
        context: &mut ConversationContext,
        emitter: &AgentEmitter,
        tool_ctx: &ToolContext,
        cancellation: &AgentCancellation,
        progress: &mut Progress,
    ) -> Result<String, AgentError> {
        let tools = self.services.tools.get_ai_tools().await;
        let mut failures = FailureTracker::new(self.settings.repeated_failure_threshold);
        let max_iterations = self.settings.max_iterations;

        for iteration in 1..=max_iterations {
            if cancellation.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            progress.iterations = iteration;
            emitter.emit(AgentEvent::AgentProgress {
                iteration,
                max_iterations,
            });

            let step = self.stream_step(context, &tools, emitter, cancellation).await?;
            progress.usage.add(&step.usage);

            if step.tool_calls.is_empty() {
                context.push(ModelMessage::assistant(step.text.clone()));
                return Ok(step.text);
            }

            context.push(ModelMessage::assistant_with_tools(&step.text, &step.tool_calls));
            let outcomes = execute_tools(
                &step.tool_calls,
                &self.services.tools,
                tool_ctx,
                emitter,
                self.settings.max_tool_output_chars,
            )
            .await?;
            context.push(ModelMessage::tool_results(to_result_content(&outcomes)));

            if let Some(error) = failures.record(&outcomes) {
                return Err(error);
            }
        }

        Err(AgentError::MaxIterationsExceeded {
            max: max_iterations,
        })
    }

    /// Stream one model response, retrying transient provider failures and
    /// shrinking the context when the provider reports an overflow.
    async fn stream_step(
        &self,
        context: &mut ConversationContext,
        tools: &[AiTool],
        emitter: &AgentEmitter,
        cancellation: &AgentCancellation,
    ) -> Result<StreamResult, AgentError> {
        let mut budget = self.settings.context_token_budget;
        let mut overflow_retries = 0;
        let provider = &self.services.provider;
        let idle_timeout = self.settings.stream_idle_timeout();

        loop {
            context.trim_to_budget(budget)?;
            let messages = context.messages();

            let attempt = tokio::select! {
                _ = cancellation.cancelled() => return Err(AgentError::Cancelled),
                result = with_retry(&self.retry, || {
                    let messages = messages.clone();
                    let tools = tools.to_vec();
                    async move {
                        let rx = provider.stream_chat(messages, tools).await?;
                        process_stream(rx, emitter, cancellation, idle_timeout).await
                    }
                }) => result,
            };

            match attempt {
                Err(AgentError::Provider(e)) if e.is_context_overflow() => {
                    if overflow_retries >= self.settings.max_overflow_retries {
                        return Err(AgentError::ContextOverflow {
                            required: context.estimate_tokens(),
                            budget,
                        });
                    }
                    overflow_retries += 1;
                    let tighter = (budget * 3 / 4).min(context.estimate_tokens() * 3 / 4);
                    tracing::warn!(
                        agent_id = %emitter.agent_id(),
                        budget,
                        tighter,
                        attempt = overflow_retries,
                        "Provider reported context overflow, trimming harder"
                    );
                    budget = tighter;
                }
                other => return other,
            }
        }
    }
}
