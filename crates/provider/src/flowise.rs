use anyhow::Result;
use async_trait::async_trait;
use colloquy_config::ProviderKind;
use serde::Deserialize;
use serde_json::json;

use crate::error::ensure_success;
use crate::types::*;
use crate::{Provider, ProviderError};

/// Flowise prediction endpoint. The configured base URL is the full
/// prediction URL (chatflow id included). Replies are never streamed.
pub struct FlowiseProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    text: Option<String>,
}

impl FlowiseProvider {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        let (question, earlier) = match request
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
        {
            Some(idx) => (&request.messages[idx].content, &request.messages[..idx]),
            None => return Err(ProviderError::EmptyRequest("flowise").into()),
        };

        let history: Vec<serde_json::Value> = earlier
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "apiMessage",
                    _ => "userMessage",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        Ok(json!({
            "question": question,
            "history": history,
            "overrideConfig": {"temperature": request.temperature},
        }))
    }
}

#[async_trait]
impl Provider for FlowiseProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Flowise
    }

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply> {
        let body = self.build_body(request)?;
        tracing::info!(provider = "flowise", endpoint = %self.endpoint, "dispatching prediction request");

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = ensure_success(req.send().await?).await?;
        let prediction: Prediction = resp.json().await?;

        let text = prediction.text.ok_or_else(|| ProviderError::UnexpectedResponse {
            provider: "flowise",
            detail: "missing `text` field".to_string(),
        })?;
        Ok(ProviderReply::Complete(ChatCompletion::from_text(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: String::new(),
            messages: vec![
                ChatMessage::new(Role::System, "sys"),
                ChatMessage::new(Role::User, "first"),
                ChatMessage::new(Role::Assistant, "reply"),
                ChatMessage::new(Role::User, "second"),
            ],
            temperature: 0.5,
            stream: true,
            web_search: false,
        }
    }

    #[tokio::test]
    async fn posts_question_with_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/prediction/flow-1"))
            .and(body_json(json!({
                "question": "second",
                "history": [
                    {"role": "userMessage", "content": "first"},
                    {"role": "apiMessage", "content": "reply"}
                ],
                "overrideConfig": {"temperature": 0.5}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "flow answer"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = FlowiseProvider::new(
            reqwest::Client::new(),
            format!("{}/api/v1/prediction/flow-1", server.uri()),
            None,
        );
        let ProviderReply::Complete(c) = provider.send(&request()).await.unwrap() else {
            panic!("flowise always answers in one payload");
        };
        assert_eq!(c.content(), Some("flow answer"));
    }

    #[tokio::test]
    async fn optional_key_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = FlowiseProvider::new(
            reqwest::Client::new(),
            server.uri(),
            Some("fw-key".into()),
        );
        provider.send(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_text_is_unexpected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"json": {}})))
            .mount(&server)
            .await;

        let provider = FlowiseProvider::new(reqwest::Client::new(), server.uri(), None);
        let err = provider.send(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::UnexpectedResponse { provider: "flowise", .. })
        ));
    }
}
