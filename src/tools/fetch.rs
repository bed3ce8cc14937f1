//! HTTP fetch tool: retrieves a URL and returns its body text.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{truncate_at_utf8_boundary, Tool, ToolContext};

/// Maximum body bytes returned to the model.
const MAX_BODY_BYTES: usize = 100 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
}

/// Fetches a URL over HTTP GET and returns status plus body text.
pub struct FetchTool {
    client: reqwest::Client,
}

impl FetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP GET and return the response body as text. \
         Large bodies are truncated."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "URL to fetch (http or https)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let input: FetchInput = serde_json::from_value(args)
            .map_err(|e| anyhow::anyhow!("invalid input for fetch tool: {e}"))?;

        let url = input.url.trim();
        if url.is_empty() {
            bail!("url cannot be empty");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("url must start with http:// or https://");
        }

        let request = self.client.get(url).send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => bail!("fetch cancelled"),
            response = request => response.map_err(|e| anyhow::anyhow!("request failed: {e}"))?,
        };

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read response body: {e}"))?;
        let (text, truncated) = truncate_at_utf8_boundary(&body, MAX_BODY_BYTES);

        if !status.is_success() {
            bail!("HTTP {status} for {url}\n{text}");
        }

        let mut result = text;
        if truncated {
            result.push_str("\n[body truncated]");
        }
        Ok(result)
    }
}
