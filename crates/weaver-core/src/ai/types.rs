//! AI SDK types for provider communication
//!
//! These are NOT domain types - they're specific to the provider boundary.
//! The agent loop keeps its conversation as `ModelMessage`s and hands them to
//! an `LlmProvider` on every step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// AI SDK Tool definition (for provider communication only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// AI SDK Tool call (for provider communication only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Content types that can be in a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Extended thinking content block
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

impl Content {
    /// Rough character weight used for token estimation
    pub fn char_len(&self) -> usize {
        match self {
            Content::Text { text } => text.len(),
            Content::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            Content::ToolResult { output, .. } => match output {
                Value::String(s) => s.len(),
                other => other.to_string().len(),
            },
            Content::Thinking { thinking } => thinking.len(),
        }
    }
}

/// Unified message format for provider communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<Content>,
}

impl ModelMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Assistant turn carrying optional text followed by tool calls
    pub fn assistant_with_tools(text: &str, calls: &[AiToolCall]) -> Self {
        let mut content = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            content.push(Content::Text {
                text: text.to_string(),
            });
        }
        content.extend(calls.iter().map(|call| Content::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        }));
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool results are sent back as one user-side message
    pub fn tool_results(results: Vec<Content>) -> Self {
        Self {
            role: Role::Tool,
            content: results,
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolUse { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolResult { .. }))
    }

    /// A user turn with actual text (not a tool result carrier)
    pub fn is_user_text(&self) -> bool {
        self.role == Role::User
            && self
                .content
                .iter()
                .any(|c| matches!(c, Content::Text { .. }))
    }

    /// Ids of the tool calls this message makes
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of the tool calls this message answers
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn char_len(&self) -> usize {
        self.content.iter().map(Content::char_len).sum()
    }
}

/// Finish reasons for model generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

/// Token usage, accumulated across agent iterations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
