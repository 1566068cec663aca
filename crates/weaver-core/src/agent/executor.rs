//! Tool execution for the agent loop.
//!
//! Handles:
//! - Validation of every call before anything runs (bad calls become error
//!   results for the model)
//! - Concurrent execution of consecutive read-only calls
//! - In-order, one-at-a-time execution of mutating and interactive calls
//! - Output truncation

use futures::future::join_all;

use crate::ai::types::{AiToolCall, Content};
use crate::error::AgentError;
use crate::tools::{truncation, ToolCategory, ToolContext, ToolRegistry, ToolResult};

use super::loop_events::{AgentEmitter, AgentEvent};

enum Step {
    /// Validation already produced the result
    Rejected(AiToolCall, ToolResult),
    /// Consecutive read-only calls
    Concurrent(Vec<AiToolCall>),
    Sequential(AiToolCall),
}

/// Execute one model turn's tool calls.
///
/// Results come back in call order. When cancellation is observed before or
/// during a step, that step's results are discarded unannounced and
/// `Cancelled` is returned.
pub(crate) async fn execute_tools(
    calls: &[AiToolCall],
    registry: &ToolRegistry,
    ctx: &ToolContext,
    emitter: &AgentEmitter,
    max_output_chars: usize,
) -> Result<Vec<(AiToolCall, ToolResult)>, AgentError> {
    let mut steps: Vec<Step> = Vec::new();

    for call in calls {
        emitter.emit(AgentEvent::ToolCall {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        match registry.validate(&call.name, &call.arguments).await {
            Err(result) => {
                tracing::debug!(
                    tool = %call.name,
                    tool_call_id = %call.id,
                    "Rejected tool call"
                );
                steps.push(Step::Rejected(call.clone(), result));
            }
            Ok(tool) if tool.category() == ToolCategory::ReadOnly => match steps.last_mut() {
                Some(Step::Concurrent(batch)) => batch.push(call.clone()),
                _ => steps.push(Step::Concurrent(vec![call.clone()])),
            },
            Ok(_) => steps.push(Step::Sequential(call.clone())),
        }
    }

    let mut outcomes = Vec::with_capacity(calls.len());

    for step in steps {
        if ctx.cancellation.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let finished: Vec<(AiToolCall, ToolResult)> = match step {
            Step::Rejected(call, result) => vec![(call, result)],
            Step::Sequential(call) => {
                let result = run_one(registry, ctx, &call).await;
                vec![(call, result)]
            }
            Step::Concurrent(batch) => {
                let results =
                    join_all(batch.iter().map(|call| run_one(registry, ctx, call))).await;
                batch.into_iter().zip(results).collect()
            }
        };

        if ctx.cancellation.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        for (call, mut result) in finished {
            result.output = truncation::truncate_head(&result.output, max_output_chars).into_output();
            emitter.emit(AgentEvent::ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                output: result.output.clone(),
                success: !result.is_error,
            });
            outcomes.push((call, result));
        }
    }

    Ok(outcomes)
}

async fn run_one(registry: &ToolRegistry, ctx: &ToolContext, call: &AiToolCall) -> ToolResult {
    registry
        .execute(&call.name, call.arguments.clone(), &ctx.for_call(&call.id))
        .await
        .unwrap_or_else(|| {
            ToolResult::error_with_code("unknown_tool", format!("Unknown tool: {}", call.name))
        })
}

/// Tool results as the content block fed back to the model
pub(crate) fn to_result_content(outcomes: &[(AiToolCall, ToolResult)]) -> Vec<Content> {
    outcomes
        .iter()
        .map(|(call, result)| Content::ToolResult {
            tool_use_id: call.id.clone(),
            output: serde_json::Value::String(result.output.clone()),
            is_error: result.is_error.then_some(true),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Records how many calls overlap
    struct Tracked {
        name: &'static str,
        category: ToolCategory,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for Tracked {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Tracks overlapping calls"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"tag": {"type": "string"}}, "required": ["tag"]})
        }

        fn category(&self) -> ToolCategory {
            self.category
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let tag = params["tag"].as_str().unwrap_or_default().to_string();
            self.log.lock().push(tag.clone());
            ToolResult::success(tag)
        }
    }

    struct Fixture {
        registry: ToolRegistry,
        peak: Arc<AtomicUsize>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    async fn fixture() -> Fixture {
        let registry = ToolRegistry::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (name, category) in [("read", ToolCategory::ReadOnly), ("write", ToolCategory::Mutating)] {
            registry
                .register(Arc::new(Tracked {
                    name,
                    category,
                    active: active.clone(),
                    peak: peak.clone(),
                    log: log.clone(),
                }))
                .await;
        }
        Fixture { registry, peak, log }
    }

    fn call(id: &str, name: &str, tag: &str) -> AiToolCall {
        AiToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: json!({"tag": tag}),
        }
    }

    fn emitter(bus: &EventBus) -> AgentEmitter {
        AgentEmitter::new(bus.clone(), "s1", "a1", Some("t1".to_string()))
    }

    #[tokio::test]
    async fn read_only_calls_run_concurrently() {
        let fx = fixture().await;
        let bus = EventBus::new(64);
        let ctx = ToolContext::new("s1", "a1");
        let calls = [call("1", "read", "a"), call("2", "read", "b"), call("3", "read", "c")];

        let outcomes = execute_tools(&calls, &fx.registry, &ctx, &emitter(&bus), 1_000)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(fx.peak.load(Ordering::SeqCst) >= 2);
        let ids: Vec<&str> = outcomes.iter().map(|(c, _)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn mutating_calls_run_alone_in_order() {
        let fx = fixture().await;
        let bus = EventBus::new(64);
        let ctx = ToolContext::new("s1", "a1");
        let calls = [call("1", "write", "w1"), call("2", "write", "w2"), call("3", "write", "w3")];

        execute_tools(&calls, &fx.registry, &ctx, &emitter(&bus), 1_000)
            .await
            .unwrap();

        assert_eq!(fx.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*fx.log.lock(), vec!["w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn invalid_calls_become_error_results() {
        let fx = fixture().await;
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe();
        let ctx = ToolContext::new("s1", "a1");
        let calls = [
            AiToolCall {
                id: "bad".into(),
                name: "read".into(),
                arguments: json!({"tag": 42}),
            },
            call("ghost", "nonexistent", "x"),
            call("ok", "read", "fine"),
        ];

        let outcomes = execute_tools(&calls, &fx.registry, &ctx, &emitter(&bus), 1_000)
            .await
            .unwrap();

        assert!(outcomes[0].1.is_error);
        assert_eq!(outcomes[0].1.error_code().as_deref(), Some("invalid_parameters"));
        assert_eq!(outcomes[1].1.error_code().as_deref(), Some("unknown_tool"));
        assert!(!outcomes[2].1.is_error);

        let mut types = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            types.push(event.event_type);
        }
        assert_eq!(types.iter().filter(|t| *t == "tool_call").count(), 3);
        assert_eq!(types.iter().filter(|t| *t == "tool_result").count(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_execution_discards_results() {
        let fx = fixture().await;
        let bus = EventBus::new(64);
        let ctx = ToolContext::new("s1", "a1");
        ctx.cancellation.cancel();

        let err = execute_tools(&[call("1", "write", "w")], &fx.registry, &ctx, &emitter(&bus), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(fx.log.lock().is_empty());
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let fx = fixture().await;
        let bus = EventBus::new(64);
        let ctx = ToolContext::new("s1", "a1");
        let long = "x".repeat(500);

        let outcomes = execute_tools(&[call("1", "read", &long)], &fx.registry, &ctx, &emitter(&bus), 100)
            .await
            .unwrap();
        assert!(outcomes[0].1.output.starts_with(&"x".repeat(100)));
        assert!(outcomes[0].1.output.contains("Output truncated"));
    }

    struct Sleeper;

    #[async_trait]
    impl Tool for Sleeper {
        fn name(&self) -> &str {
            "sleep"
        }

        fn description(&self) -> &str {
            "Sleeps"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn category(&self) -> ToolCategory {
            ToolCategory::ReadOnly
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ToolResult::success("woke")
        }
    }

    #[tokio::test]
    async fn cancelled_mid_step_emits_no_tool_result() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Sleeper)).await;
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe();
        let ctx = ToolContext::new("s1", "a1");

        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let sleep_call = AiToolCall {
            id: "1".into(),
            name: "sleep".into(),
            arguments: json!({}),
        };
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            execute_tools(&[sleep_call], &registry, &ctx, &emitter(&bus), 1_000),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));

        let mut types = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            types.push(event.event_type);
        }
        assert_eq!(types, vec!["tool_call"]);
    }
}
