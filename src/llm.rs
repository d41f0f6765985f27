//! Messages-API client for the configured LLM provider.
//!
//! Non-streaming create() with tool definitions; responses come back as
//! typed content blocks (text / tool_use). The specialists drive their own
//! tool loops on top of this.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::SETTINGS;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

pub struct LlmClient {
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    pub fn is_configured(&self) -> bool {
        !SETTINGS.llm_api_key.is_empty()
    }

    /// One messages-API call. `messages` entries are `{role, content}` values
    /// so callers can thread tool_result blocks through multi-turn loops.
    pub async fn create_message(
        &self,
        model: &str,
        system: &str,
        messages: &[Value],
        tools: Option<&[ToolDef]>,
        max_tokens: u32,
    ) -> Result<LlmResponse> {
        if !self.is_configured() {
            bail!("LLM provider is not configured (missing LLM_API_KEY)");
        }
        let mut payload = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                payload["tools"] = serde_json::to_value(tools)?;
            }
        }

        let url = format!("{}/v1/messages", SETTINGS.llm_base_url.trim_end_matches('/'));
        // One retry on transient upstream pressure.
        for attempt in 1..=2u32 {
            let response = self
                .http
                .post(&url)
                .header("x-api-key", &SETTINGS.llm_api_key)
                .header("anthropic-version", API_VERSION)
                .json(&payload)
                .send()
                .await
                .context("LLM request failed")?;

            let status = response.status().as_u16();
            if (status == 429 || status >= 500) && attempt == 1 {
                warn!(status, "LLM call rate-limited/unavailable, retrying once");
                tokio::time::sleep(Duration::from_millis(750)).await;
                continue;
            }
            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("LLM API error {status}: {}", body.chars().take(300).collect::<String>());
            }
            return response.json::<LlmResponse>().await.context("decode LLM response");
        }
        bail!("LLM call did not complete")
    }
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper for building a plain user message.
pub fn user_message(content: &str) -> Value {
    serde_json::json!({ "role": "user", "content": content })
}

/// Assistant turn echoing the model's content blocks (needed before
/// tool_result messages in a tool loop).
pub fn assistant_tool_use_message(id: &str, name: &str, input: &Value) -> Value {
    serde_json::json!({
        "role": "assistant",
        "content": [{ "type": "tool_use", "id": id, "name": name, "input": input }],
    })
}

pub fn tool_result_message(tool_use_id: &str, content: &str) -> Value {
    serde_json::json!({
        "role": "user",
        "content": [{ "type": "tool_result", "tool_use_id": tool_use_id, "content": content }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_blocks_decode() {
        let raw = serde_json::json!({
            "content": [
                {"type": "text", "text": "Checking "},
                {"type": "tool_use", "id": "tu_1", "name": "get_quote", "input": {"symbol": "AAPL"}},
                {"type": "text", "text": "now."}
            ],
            "stop_reason": "tool_use"
        });
        let response: LlmResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.text(), "Checking now.");
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "get_quote");
        assert_eq!(uses[0].2["symbol"], "AAPL");
    }

    #[test]
    fn unknown_block_types_are_tolerated() {
        let raw = serde_json::json!({
            "content": [{"type": "thinking", "thinking": "..."}, {"type": "text", "text": "hi"}]
        });
        let response: LlmResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.text(), "hi");
    }

    #[test]
    fn tool_loop_message_shapes() {
        let msg = tool_result_message("tu_1", "ok");
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "tu_1");
    }
}
