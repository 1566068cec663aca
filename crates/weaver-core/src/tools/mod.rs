//! Tools available to agents
//!
//! Provides the tool registry, argument validation, output truncation, and
//! the built-in `ask_user` tool.

pub mod ask_user;
pub mod registry;
pub mod truncation;

pub use ask_user::AskUserTool;
pub use registry::{parse_params, Tool, ToolCategory, ToolContext, ToolRegistry, ToolResult};
