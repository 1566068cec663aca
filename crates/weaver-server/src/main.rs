//! Weaver Server
//!
//! Self-hosted API server for session event streams and run control.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use weaver_core::agent::{AgentLoop, AgentServices, AgentTaskRunner};
use weaver_core::ai::types::{AiTool, ModelMessage};
use weaver_core::ai::{LlmProvider, StreamPart};
use weaver_core::events::EventBus;
use weaver_core::plan::TaskRunner;
use weaver_core::tools::{AskUserTool, ToolRegistry};
use weaver_core::{ProviderError, WeaverConfig};

/// Stand-in provider until a real LLM backend is wired in.
///
/// Every request fails permanently, so tasks fail fast instead of retrying.
struct UnconfiguredProvider;

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn stream_chat(
        &self,
        _messages: Vec<ModelMessage>,
        _tools: Vec<AiTool>,
    ) -> Result<mpsc::UnboundedReceiver<StreamPart>, ProviderError> {
        Err(ProviderError::permanent("no LLM provider is configured"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = WeaverConfig::load()?;

    let tools = Arc::new(ToolRegistry::with_timeout(config.agent.tool_timeout()));
    tools.register(Arc::new(AskUserTool)).await;
    tracing::warn!("No LLM provider configured; tasks will fail until one is wired in");

    let agent_settings = config.agent.clone();
    let provider_retry = config.provider_retry.clone();
    let make_runner = move |bus: &EventBus| -> Arc<dyn TaskRunner> {
        let agent = AgentLoop::new(
            AgentServices {
                provider: Arc::new(UnconfiguredProvider),
                tools,
                bus: bus.clone(),
            },
            agent_settings,
            provider_retry,
        );
        Arc::new(AgentTaskRunner::new(Arc::new(agent)))
    };

    weaver_server::start_server(config, make_runner, false).await
}
