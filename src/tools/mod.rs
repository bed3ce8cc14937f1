//! Tool system: the trait tools implement plus the built-ins.

pub mod bash;
pub mod fetch;

pub use bash::BashTool;
pub use fetch::FetchTool;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::provider::ToolDescriptor;
use crate::runtime::Runtime;

/// Context supplied to every tool execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Side-effect boundary the tool goes through.
    pub runtime: Arc<dyn Runtime>,
    /// Cancelled when the surrounding turn is cancelled.
    pub cancel: CancellationToken,
}

/// A capability the model can invoke.
///
/// The returned string is the tool result surfaced to the model. An `Err`
/// becomes an error tool result carrying the error's display string; the
/// turn continues either way.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Builds the descriptor handed to providers.
pub fn descriptor(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.parameters(),
    }
}

/// Truncates a byte slice at a valid UTF-8 character boundary.
///
/// Returns the truncated string and whether truncation occurred.
pub(crate) fn truncate_at_utf8_boundary(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    if bytes.len() <= max_bytes {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    // Walk backwards past UTF-8 continuation bytes (10xxxxxx).
    let mut end = max_bytes;
    while end > 0 && (bytes[end - 1] & 0xC0) == 0x80 {
        end -= 1;
    }
    // A multi-byte sequence start that would extend past the cut is dropped.
    if end > 0 && bytes[end - 1] >= 0xC0 {
        end -= 1;
    }

    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true)
}
