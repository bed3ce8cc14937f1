//! Language-model provider interface consumed by the turn loop.
//!
//! Adapters translate a concrete wire protocol into a stream of
//! [`StreamPart`]s. The loop is transport-agnostic: anything a protocol
//! carries beyond these parts is dropped at the adapter boundary.

mod message;

pub use message::{ChatMessage, ContentBlock, MessageContent, Role};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Token usage for one model round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
}

/// Tool descriptor handed to the provider.
///
/// `input_schema` is a JSON Schema object describing the tool's arguments.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One part of a streamed model response.
#[derive(Debug, Clone)]
pub enum StreamPart {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A complete tool call with parsed input.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// Terminal part: usage and finish reason for the round-trip.
    Finish {
        usage: Usage,
        finish_reason: String,
    },
}

/// A streamed model response.
pub type ProviderStream = BoxStream<'static, Result<StreamPart>>;

/// Request for one model round-trip.
pub struct ProviderRequest<'a> {
    pub system: Option<&'a str>,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDescriptor],
    /// Cancelled when the surrounding turn is cancelled; adapters should
    /// abort the request promptly.
    pub cancel: CancellationToken,
}

/// A streaming language-model adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Starts one streamed round-trip against the model.
    async fn stream(&self, request: ProviderRequest<'_>) -> Result<ProviderStream>;
}
