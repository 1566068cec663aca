//! Tool registry for managing available tools
//!
//! Tools are a capability set handed to the agent loop. The registry owns
//! argument validation, per-call timeouts, and cancellation so individual
//! tools only implement their own behavior.

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::agent::AgentCancellation;
use crate::ai::types::AiTool;
use crate::constants;
use crate::run::InputGate;

/// How a tool interacts with shared state; decides concurrent vs ordered execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// Never modifies state; may run concurrently with other read-only calls.
    ReadOnly,
    /// Modifies shared state; runs alone, in call order.
    Mutating,
    /// Requires user input; runs alone, in call order.
    Interactive,
}

impl ToolCategory {
    pub fn is_concurrent_safe(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Tool execution result
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a success result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create a structured success envelope with `ok=true` and `data`.
    pub fn success_data(data: Value) -> Self {
        Self {
            output: serde_json::json!({ "ok": true, "data": data }).to_string(),
            is_error: false,
        }
    }

    /// Create a structured error with explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        Self {
            output: serde_json::json!({
                "ok": false,
                "error": { "code": code, "message": msg.to_string() }
            })
            .to_string(),
            is_error: true,
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_parameters(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    /// Create an error result, classifying the message into a code
    pub fn error(msg: impl std::fmt::Display) -> Self {
        let message = msg.to_string();
        let code = classify_error_code(&message);
        Self::error_with_code(code, message)
    }

    /// Error code of a structured error result
    pub fn error_code(&self) -> Option<String> {
        if !self.is_error {
            return None;
        }
        serde_json::from_str::<Value>(&self.output)
            .ok()
            .and_then(|v| v["error"]["code"].as_str().map(str::to_string))
    }
}

/// Parse tool parameters, returning a ToolResult error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

pub(crate) fn classify_error_code(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid parameters")
        || lower.contains("missing field")
        || lower.contains("unknown field")
    {
        "invalid_parameters"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("cancelled") {
        "cancelled"
    } else if lower.contains("unknown tool") {
        "unknown_tool"
    } else {
        "tool_error"
    }
}

/// Context for one tool call
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub run_id: Option<String>,
    /// Id of the model's tool call being served
    pub tool_call_id: Option<String>,
    pub cancellation: AgentCancellation,
    /// Present when the agent runs inside a run that can ask the user
    pub input_gate: Option<Arc<InputGate>>,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            task_id: None,
            run_id: None,
            tool_call_id: None,
            cancellation: AgentCancellation::new(),
            input_gate: None,
            timeout: None,
        }
    }

    pub fn with_task(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_cancellation(mut self, cancellation: AgentCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_input_gate(mut self, gate: Option<Arc<InputGate>>) -> Self {
        self.run_id = gate.as_ref().map(|g| g.run_id().to_string());
        self.input_gate = gate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn for_call(&self, tool_call_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.tool_call_id = Some(tool_call_id.to_string());
        ctx
    }
}

/// Trait for tool implementations
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id)
    fn name(&self) -> &str;

    /// Tool description for AI
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    fn category(&self) -> ToolCategory {
        ToolCategory::Mutating
    }

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// A tool with its parameters schema compiled at registration
struct Registered {
    tool: Arc<dyn Tool>,
    /// Compile error when the tool ships a malformed schema
    schema: Result<JSONSchema, String>,
}

impl Registered {
    fn new(tool: Arc<dyn Tool>) -> Self {
        let schema_json = tool.parameters_schema();
        let schema = JSONSchema::compile(&schema_json).map_err(|e| e.to_string());
        if let Err(reason) = &schema {
            tracing::warn!(tool = tool.name(), %reason, "Tool parameters schema does not compile");
        }
        Self { tool, schema }
    }

    /// Every violation of the schema, one line each
    fn violations(&self, params: &Value) -> Result<Vec<String>, String> {
        let schema = self.schema.as_ref().map_err(Clone::clone)?;
        let violations = match schema.validate(params) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect(),
        };
        Ok(violations)
    }
}

/// Registry for managing tools
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<Registered>>>>,
    /// Default timeout for tool execution
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(constants::agent::TOOL_TIMEOUT_SECS))
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Register a tool
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let entry = Arc::new(Registered::new(tool));
        let mut tools = self.tools.write().await;
        tools.insert(name, entry);
    }

    async fn entry(&self, name: &str) -> Option<Arc<Registered>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Get a tool by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entry(name).await.map(|e| e.tool.clone())
    }

    /// Get all tools as AI tool definitions, sorted by name
    pub async fn get_ai_tools(&self) -> Vec<AiTool> {
        let tools = self.tools.read().await;
        let mut defs: Vec<AiTool> = tools
            .values()
            .map(|e| &e.tool)
            .map(|t| AiTool {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve a tool and check arguments against its schema.
    ///
    /// The error is a ready-to-feed-back tool result.
    pub async fn validate(&self, name: &str, params: &Value) -> Result<Arc<dyn Tool>, ToolResult> {
        let Some(entry) = self.entry(name).await else {
            return Err(ToolResult::error_with_code(
                "unknown_tool",
                format!("Unknown tool: {}", name),
            ));
        };
        let violations = entry.violations(params).map_err(|reason| {
            ToolResult::error_with_code(
                "invalid_schema",
                format!("Tool '{}' has an unusable parameters schema: {}", name, reason),
            )
        })?;
        if !violations.is_empty() {
            return Err(ToolResult::invalid_parameters(format!(
                "Invalid parameters: {}",
                violations.join("; ")
            )));
        }
        Ok(entry.tool.clone())
    }

    /// Category of a registered tool; unknown tools count as mutating
    pub async fn category(&self, name: &str) -> ToolCategory {
        self.get(name)
            .await
            .map(|t| t.category())
            .unwrap_or(ToolCategory::Mutating)
    }

    /// Execute a tool by name with timeout and cancellation.
    ///
    /// Returns `None` when no tool has that name.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Option<ToolResult> {
        let tool = self.get(name).await?;
        // Interactive tools wait on a human; only cancellation ends them early
        let limit = match tool.category() {
            ToolCategory::Interactive => None,
            _ => Some(ctx.timeout.unwrap_or(self.default_timeout)),
        };
        let start = Instant::now();
        tracing::debug!(tool = name, session_id = %ctx.session_id, "Executing tool");

        let result = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                ToolResult::error_with_code("cancelled", format!("Tool '{}' was cancelled", name))
            }
            outcome = with_limit(limit, tool.execute(params, ctx)) => match outcome {
                Ok(result) => result,
                Err(timeout) => {
                    tracing::warn!(
                        tool = name,
                        timeout_secs = timeout.as_secs(),
                        "Tool execution timed out"
                    );
                    ToolResult::error_with_code(
                        "timeout",
                        format!("Tool '{}' timed out after {} seconds", name, timeout.as_secs()),
                    )
                }
            },
        };

        tracing::debug!(
            tool = name,
            is_error = result.is_error,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool finished"
        );
        Some(result)
    }
}

/// Run `fut` under an optional time limit; the error carries the limit hit
async fn with_limit<F: std::future::Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}
