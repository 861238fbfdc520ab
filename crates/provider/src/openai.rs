use anyhow::Result;
use async_trait::async_trait;
use colloquy_config::ProviderKind;
use serde_json::json;

use crate::error::ensure_success;
use crate::types::*;
use crate::{byte_stream, Provider};

const OPENROUTER_REFERER: &str = "https://github.com/colloquy-chat/colloquy";
const OPENROUTER_TITLE: &str = "colloquy";

/// Chat-completions adapter shared by OpenAI, Groq and OpenRouter.
pub struct OpenAICompatibleProvider {
    kind: ProviderKind,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAICompatibleProvider {
    pub fn new(
        kind: ProviderKind,
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    ) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": request.stream,
        })
    }

    fn chat_request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if self.kind == ProviderKind::OpenRouter {
            req = req
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::info!(provider = %self.kind, model = %request.model, stream = request.stream, "dispatching chat request");

        let resp = self
            .chat_request(&url)
            .json(&self.build_body(request))
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        if request.stream {
            Ok(ProviderReply::Stream(byte_stream(resp)))
        } else {
            let completion: ChatCompletion = resp.json().await?;
            Ok(ProviderReply::Complete(completion))
        }
    }
}
