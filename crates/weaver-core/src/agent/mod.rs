//! Agent system
//!
//! ## Agent loop
//! - `AgentLoop` - one agent's tool-calling conversation with the model
//! - `AgentEvent` / `AgentEmitter` - events the loop publishes on the bus
//! - `ConversationContext` - FIFO-with-pinning context trimming
//!
//! ## Integration
//! - `AgentTaskRunner` - runs plan tasks as agent loop invocations
//! - `AgentCancellation` - cooperative cancellation handle

pub mod agent_loop;
pub mod cancellation;
pub mod context;
pub mod executor;
pub mod failure;
pub mod loop_events;
pub mod runner;
pub mod stream;

pub use agent_loop::{AgentLoop, AgentOutcome, AgentRequest, AgentServices};
pub use cancellation::AgentCancellation;
pub use context::{ConversationContext, TrimReport};
pub use loop_events::{AgentEmitter, AgentEvent};
pub use runner::AgentTaskRunner;

use serde::{Deserialize, Serialize};

/// Role an agent plays in the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Clarifies requirements with the user
    Interview,
    /// Produces the artifact
    Generation,
    /// Revises an existing artifact
    Refinement,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Generation => "generation",
            Self::Refinement => "refinement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interview" => Some(Self::Interview),
            "generation" => Some(Self::Generation),
            "refinement" => Some(Self::Refinement),
            _ => None,
        }
    }

    /// Base system instruction for this agent role
    pub fn system_instruction(&self) -> &'static str {
        match self {
            Self::Interview => {
                "You gather requirements. Ask the user focused clarifying questions with the \
                 ask_user tool until the goal is unambiguous, then summarize the agreed requirements."
            }
            Self::Generation => {
                "You produce the requested artifact. Use the available tools to inspect and \
                 build it, then reply with a short summary of what you produced."
            }
            Self::Refinement => {
                "You improve an existing artifact according to feedback. Make targeted changes \
                 with the available tools and reply with a summary of what changed."
            }
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
