//! skein is a framework for conversational agents that alternate between a
//! streaming language model and externally-executed tools.
//!
//! The crate owns the agent turn loop: a state machine that drives a model
//! to completion, mediates tool calls (approval, override, parallel
//! execution, ordered result emission), supports mid-turn user intervention
//! (steering and queued follow-ups), and persists an append-only,
//! branchable conversation history.
//!
//! The model transport itself is behind the [`provider::Provider`] trait;
//! side effects go through [`runtime::Runtime`]; history lives behind
//! [`store::SessionStore`]. All three ship with default implementations.

pub mod core;
pub mod error;
pub mod provider;
pub mod runtime;
pub mod store;
pub mod tools;

pub use crate::core::agent::{Agent, AgentBuilder, ResumeOptions, SessionOptions};
pub use crate::core::events::{AgentEvent, EventKind, ToolDecision, STEERING_DENY_REASON};
pub use crate::core::history::{
    build_context, CompactionEntry, EntryBase, MessageEntry, SessionEntry,
};
pub use crate::core::session::{
    ListenerId, SendMode, SendOptions, Session, ToolCallRequest,
};
pub use crate::error::{Error, Result};
pub use crate::provider::{
    ChatMessage, ContentBlock, MessageContent, Provider, ProviderRequest, ProviderStream, Role,
    StreamPart, ToolDescriptor, Usage,
};
pub use crate::runtime::{ExecOptions, ExecOutput, LocalRuntime, Runtime};
pub use crate::store::{JsonlStore, MemoryStore, SessionStore};
pub use crate::tools::{Tool, ToolContext};
