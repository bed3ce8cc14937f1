//! Event and decision vocabulary for the turn loop and session.
//!
//! Events are serializable so callers can mirror them to wire formats or
//! log files without translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::{ChatMessage, Usage};

/// Result text recorded on tool calls auto-denied by mid-step steering.
pub const STEERING_DENY_REASON: &str = "Skipped: user sent a new message";

/// Events observable on a session.
///
/// Within one step, events arrive strictly in the order: `text_delta`* →
/// `message` → `step` → (`tool_call`+ → `tool_result`+)?. A successful
/// turn ends with exactly one `turn_end`; a failed one with `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental assistant text.
    TextDelta { delta: String },

    /// A fully-formed message appended to the conversation (user,
    /// assistant, or steering/follow-up injection).
    Message { message: ChatMessage },

    /// The model requested a tool call; a decision is collected from
    /// tool-call listeners before anything executes.
    ToolCall {
        call_id: String,
        name: String,
        args: Value,
    },

    /// Outcome of one tool call. Emitted in original call order, carrying
    /// the synthesized tool-role message.
    ToolResult {
        call_id: String,
        name: String,
        result: String,
        is_error: bool,
        message: ChatMessage,
    },

    /// One model round-trip finished.
    Step { usage: Usage, finish_reason: String },

    /// The turn completed. `messages` holds every message appended during
    /// the turn; `text` is the latest assistant text.
    TurnEnd {
        messages: Vec<ChatMessage>,
        text: String,
    },

    /// The turn failed. The same error rejects `wait_for_idle`.
    Error { message: String },
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::TextDelta { .. } => EventKind::TextDelta,
            AgentEvent::Message { .. } => EventKind::Message,
            AgentEvent::ToolCall { .. } => EventKind::ToolCall,
            AgentEvent::ToolResult { .. } => EventKind::ToolResult,
            AgentEvent::Step { .. } => EventKind::Step,
            AgentEvent::TurnEnd { .. } => EventKind::TurnEnd,
            AgentEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Event tags used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TextDelta,
    Message,
    ToolCall,
    ToolResult,
    Step,
    TurnEnd,
    Error,
}

/// Decision returned by a tool-call listener.
///
/// No decision (`None` from every listener) means the call executes with
/// its original arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    /// Skip execution; the reason becomes an error tool result.
    Deny { reason: String },
    /// Execute with substituted arguments.
    Rewrite { args: Value },
}
