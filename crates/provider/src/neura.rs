use anyhow::Result;
use async_trait::async_trait;
use colloquy_config::ProviderKind;
use serde_json::json;

use crate::error::ensure_success;
use crate::types::*;
use crate::{byte_stream, sse, Provider};

const DEFAULT_MODEL: &str = "neurarouter-default";

/// Neura Router. Upstream is always asked to stream; a non-streaming request
/// is served by draining that stream into a single completion.
pub struct NeuraRouterProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NeuraRouterProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        // The router has no system role.
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => Role::User,
                    other => other,
                };
                json!({"role": role.as_str(), "content": m.content})
            })
            .collect();

        let model = if request.model.is_empty() {
            DEFAULT_MODEL
        } else {
            request.model.as_str()
        };

        json!({
            "messages": messages,
            "model": model,
            "temperature": request.temperature,
            "stream": true,
        })
    }
}

#[async_trait]
impl Provider for NeuraRouterProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::NeuraRouter
    }

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply> {
        let url = format!("{}/chat/completions/router", self.base_url);
        tracing::info!(provider = "neurarouter", model = %request.model, stream = request.stream, "dispatching chat request");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.build_body(request))
            .send()
            .await?;
        let bytes = byte_stream(ensure_success(resp).await?);

        if request.stream {
            Ok(ProviderReply::Stream(bytes))
        } else {
            let text = sse::collect_text(bytes).await;
            Ok(ProviderReply::Complete(ChatCompletion::from_text(text)))
        }
    }
}
