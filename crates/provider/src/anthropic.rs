use anyhow::Result;
use async_trait::async_trait;
use colloquy_config::ProviderKind;
use serde_json::json;

use crate::error::ensure_success;
use crate::types::*;
use crate::{byte_stream, Provider, ProviderError};

const API_VERSION: &str = "2023-06-01";
const STREAM_MAX_TOKENS: u32 = 16_000;
const MAX_TOKENS: u32 = 4_096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// System turns are sent as user turns; blank turns are dropped.
    fn build_messages(&self, request: &ChatRequest) -> Result<Vec<serde_json::Value>> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "assistant",
                    Role::System | Role::User => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        if messages.is_empty() {
            return Err(ProviderError::EmptyRequest("anthropic").into());
        }
        Ok(messages)
    }

    fn build_body(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        let max_tokens = if request.stream {
            STREAM_MAX_TOKENS
        } else {
            MAX_TOKENS
        };
        Ok(json!({
            "model": request.model,
            "max_tokens": max_tokens,
            "messages": self.build_messages(request)?,
            "temperature": request.temperature,
            "stream": request.stream,
        }))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply> {
        let body = self.build_body(request)?;
        let url = format!("{}/messages", self.base_url);
        tracing::info!(provider = "anthropic", model = %request.model, stream = request.stream, "dispatching chat request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        if request.stream {
            return Ok(ProviderReply::Stream(byte_stream(resp)));
        }

        let data: serde_json::Value = resp.json().await?;
        let text = data["content"][0]["text"].as_str().unwrap_or_default();
        let mut completion = ChatCompletion::from_text(text);
        if let Some(id) = data["id"].as_str() {
            completion.id = Some(id.to_string());
        }
        Ok(ProviderReply::Complete(completion))
    }
}
