//! Repeated tool failure detection.
//!
//! Tool errors are fed back to the model, never retried by the loop. When the
//! model keeps making the same failing call, the loop gives up with a
//! `ToolExecution` error instead of burning the remaining iterations.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::ai::types::AiToolCall;
use crate::error::AgentError;
use crate::tools::ToolResult;

/// Counts identical (tool, arguments, error) failures across iterations
#[derive(Debug)]
pub(crate) struct FailureTracker {
    threshold: usize,
    counters: HashMap<u64, usize>,
}

impl FailureTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            counters: HashMap::new(),
        }
    }

    /// Record one iteration's outcomes. Any success clears the counters.
    pub fn record(&mut self, outcomes: &[(AiToolCall, ToolResult)]) -> Option<AgentError> {
        let mut saw_success = false;

        for (call, result) in outcomes {
            if !result.is_error {
                saw_success = true;
                continue;
            }

            let (code, message) = error_signature(&result.output);
            let signature = hash_signature(&call.name, &call.arguments, &code, &message);
            let count = self.counters.entry(signature).or_insert(0);
            *count += 1;

            if *count >= self.threshold {
                return Some(AgentError::ToolExecution {
                    tool: call.name.clone(),
                    message: format!(
                        "failed {} times in a row with the same '{}' error: {}",
                        count, code, message
                    ),
                });
            }
        }

        if saw_success {
            self.counters.clear();
        }
        None
    }
}

fn error_signature(output: &str) -> (String, String) {
    let parsed = serde_json::from_str::<Value>(output).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("tool_error")
        .to_string();
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(output);
    (code, normalize(message))
}

fn normalize(message: &str) -> String {
    let compact = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return "unknown".to_string();
    }
    compact.to_ascii_lowercase().chars().take(160).collect()
}

fn hash_signature(tool: &str, arguments: &Value, code: &str, message: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    tool.hash(&mut hasher);
    arguments.to_string().hash(&mut hasher);
    code.hash(&mut hasher);
    message.hash(&mut hasher);
    hasher.finish()
}
