//! Conversation context with FIFO-with-pinning trimming
//!
//! The system instruction and pinned messages are never evicted, nor is the
//! latest user turn. Everything else goes oldest-first, with a tool-use
//! message and the results answering it evicted as one unit.

use std::collections::HashSet;

use crate::ai::types::{Content, ModelMessage, Role};
use crate::error::AgentError;

/// Fixed per-message overhead in estimated tokens
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
struct ContextEntry {
    message: ModelMessage,
    pinned: bool,
}

/// What a trim pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub evicted_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// An agent's working conversation
#[derive(Debug, Clone)]
pub struct ConversationContext {
    system: String,
    entries: Vec<ContextEntry>,
}

impl ConversationContext {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            entries: Vec::new(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn push(&mut self, message: ModelMessage) {
        self.entries.push(ContextEntry {
            message,
            pinned: false,
        });
    }

    /// Add a message that trimming must never evict
    pub fn push_pinned(&mut self, message: ModelMessage) {
        self.entries.push(ContextEntry {
            message,
            pinned: true,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages to send, system instruction first
    pub fn messages(&self) -> Vec<ModelMessage> {
        let mut messages = Vec::with_capacity(self.entries.len() + 1);
        if !self.system.is_empty() {
            messages.push(ModelMessage {
                role: Role::System,
                content: vec![Content::Text {
                    text: self.system.clone(),
                }],
            });
        }
        messages.extend(self.entries.iter().map(|e| e.message.clone()));
        messages
    }

    /// Rough token estimate of everything that would be sent
    pub fn estimate_tokens(&self) -> usize {
        let system = self.system.len().div_ceil(CHARS_PER_TOKEN);
        let messages: usize = self
            .entries
            .iter()
            .map(|e| estimate_message_tokens(&e.message))
            .sum();
        system + messages
    }

    /// Evict oldest unprotected messages until the estimate fits `budget`.
    ///
    /// Fails with `ContextOverflow` when only protected messages remain and
    /// they alone exceed the budget.
    pub fn trim_to_budget(&mut self, budget: usize) -> Result<TrimReport, AgentError> {
        let tokens_before = self.estimate_tokens();
        let mut current = tokens_before;
        let mut evicted = 0;

        while current > budget {
            let Some(unit) = self.next_eviction_unit() else {
                return Err(AgentError::ContextOverflow {
                    required: current,
                    budget,
                });
            };
            evicted += unit.len();
            let doomed: HashSet<usize> = unit.into_iter().collect();
            let mut index = 0;
            self.entries.retain(|_| {
                let keep = !doomed.contains(&index);
                index += 1;
                keep
            });
            current = self.estimate_tokens();
        }

        if evicted > 0 {
            tracing::debug!(
                evicted,
                tokens_before,
                tokens_after = current,
                budget,
                "Trimmed conversation context"
            );
        }

        Ok(TrimReport {
            evicted_messages: evicted,
            tokens_before,
            tokens_after: current,
        })
    }

    fn latest_user_turn(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.message.is_user_text())
    }

    /// Oldest evictable group of entry indexes
    fn next_eviction_unit(&self) -> Option<Vec<usize>> {
        let protected = self.latest_user_turn();
        let is_locked = |i: usize| self.entries[i].pinned || Some(i) == protected;

        for (i, entry) in self.entries.iter().enumerate() {
            if is_locked(i) {
                continue;
            }

            let message = &entry.message;
            let unit = if message.has_tool_use() {
                let ids: HashSet<&str> = message.tool_use_ids().into_iter().collect();
                let mut unit = vec![i];
                unit.extend(
                    self.entries
                        .iter()
                        .enumerate()
                        .skip(i + 1)
                        .filter(|(_, e)| e.message.tool_result_ids().iter().any(|id| ids.contains(id)))
                        .map(|(j, _)| j),
                );
                unit
            } else if message.has_tool_result() {
                // Results still paired with an earlier tool use leave with it
                let result_ids = message.tool_result_ids();
                let paired = self.entries[..i].iter().any(|e| {
                    e.message
                        .tool_use_ids()
                        .iter()
                        .any(|id| result_ids.contains(id))
                });
                if paired {
                    continue;
                }
                vec![i]
            } else {
                vec![i]
            };

            if unit.iter().all(|&j| !is_locked(j)) {
                return Some(unit);
            }
        }
        None
    }
}

fn estimate_message_tokens(message: &ModelMessage) -> usize {
    message.char_len().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS
}
