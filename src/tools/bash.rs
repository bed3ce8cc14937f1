//! Shell tool: runs a command through the session's runtime.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{truncate_at_utf8_boundary, Tool, ToolContext};
use crate::runtime::{ExecOptions, Runtime};

/// Maximum bytes per output stream (stdout/stderr) before truncation.
const MAX_OUTPUT_BYTES: usize = 40 * 1024;

/// Default command deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
}

/// Executes shell commands and reports stdout, stderr, and exit code.
pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command. Returns stdout and stderr; a non-zero \
         exit code is reported as an error result."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: BashInput = serde_json::from_value(args)
            .map_err(|e| anyhow::anyhow!("invalid input for bash tool: {e}"))?;
        if input.command.trim().is_empty() {
            bail!("command cannot be empty");
        }

        let output = ctx
            .runtime
            .exec(
                &input.command,
                ExecOptions {
                    timeout: Some(self.timeout),
                    cancel: Some(ctx.cancel.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let (stdout, stdout_truncated) =
            truncate_at_utf8_boundary(output.stdout.as_bytes(), MAX_OUTPUT_BYTES);
        let (stderr, stderr_truncated) =
            truncate_at_utf8_boundary(output.stderr.as_bytes(), MAX_OUTPUT_BYTES);

        let mut text = stdout;
        if stdout_truncated {
            text.push_str("\n[stdout truncated]");
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
            if stderr_truncated {
                text.push_str("\n[stderr truncated]");
            }
        }

        if output.exit_code != 0 {
            bail!("{}\n(exit code {})", text.trim_end(), output.exit_code);
        }
        Ok(text)
    }
}
