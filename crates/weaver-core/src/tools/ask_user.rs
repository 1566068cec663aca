//! Ask user tool - puts a clarifying question to the user and waits for the answer

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::registry::{parse_params, Tool, ToolCategory, ToolContext, ToolResult};

pub struct AskUserTool;

#[derive(Deserialize)]
struct Params {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question and wait for their answer. Use this only when \
         the request is ambiguous and you cannot proceed without the user's decision."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The question to show the user"
                },
                "options": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Suggested answers the user can pick from"
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Interactive
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let Some(gate) = &ctx.input_gate else {
            return ToolResult::error_with_code(
                "no_user_channel",
                "No user is attached to this agent; make a reasonable assumption and state it",
            );
        };

        match gate
            .ask(
                &params.question,
                params.options,
                ctx.task_id.as_deref(),
                &ctx.agent_id,
                &ctx.cancellation,
            )
            .await
        {
            Ok(answer) => ToolResult::success_data(json!({ "answer": answer })),
            Err(e) => ToolResult::error_with_code("cancelled", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::run::{InputGate, RunStatus};
    use crate::tools::ToolRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    #[tokio::test]
    async fn without_gate_reports_no_channel() {
        let result = AskUserTool
            .execute(json!({"question": "Color?"}), &ToolContext::new("s1", "a1"))
            .await;
        assert_eq!(result.error_code().as_deref(), Some("no_user_channel"));
    }

    #[tokio::test]
    async fn answer_flows_back_through_registry() {
        let bus = EventBus::new(64);
        let (status, _rx) = watch::channel(RunStatus::Running);
        let gate = Arc::new(InputGate::new("r1", "s1", bus, Arc::new(status)));
        let registry = Arc::new(ToolRegistry::with_timeout(Duration::from_millis(10)));
        registry.register(Arc::new(AskUserTool)).await;

        let ctx = ToolContext::new("s1", "a1").with_input_gate(Some(gate.clone()));
        assert_eq!(ctx.run_id.as_deref(), Some("r1"));

        let call = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute("ask_user", json!({"question": "Color?", "options": ["red", "blue"]}), &ctx)
                    .await
            })
        };

        // Outlives the registry's 10ms tool timeout on purpose
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.provide_input("blue", None).unwrap();

        let result = call.await.unwrap().unwrap();
        assert!(!result.is_error);
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(parsed["data"]["answer"], "blue");
    }
}
