use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use colloquy_config::ProviderKind;
use futures::stream::StreamExt;
use serde_json::json;

use crate::error::ensure_success;
use crate::types::*;
use crate::{Provider, ProviderError};

/// Characters per synthesized stream frame.
const CHUNK_CHARS: usize = 20;
const CHUNK_DELAY: Duration = Duration::from_millis(2);
const MAX_OUTPUT_TOKENS: u32 = 8196;

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Source {
    uri: String,
    title: String,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        if !request.messages.iter().any(|m| m.role == Role::User) {
            return Err(ProviderError::EmptyRequest("google").into());
        }

        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "topP": 1,
                "topK": 1,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
            },
        });

        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        if request.web_search {
            body["tools"] = json!([{"google_search": {}}]);
        }
        Ok(body)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply> {
        let body = self.build_body(request)?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );
        tracing::info!(provider = "google", model = %request.model, web_search = request.web_search, "dispatching chat request");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let data: serde_json::Value = ensure_success(resp).await?.json().await?;

        let text = response_text(&data);
        let sources = grounding_sources(&data);
        tracing::debug!(chars = text.len(), sources = sources.len(), "google response received");

        if request.stream {
            Ok(ProviderReply::Stream(synthesize_stream(text, sources)))
        } else {
            let mut text = text;
            if !sources.is_empty() {
                text.push_str(&sources_section(&sources));
            }
            Ok(ProviderReply::Complete(ChatCompletion::from_text(text)))
        }
    }
}

fn response_text(data: &serde_json::Value) -> String {
    data["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Web sources from grounding metadata, deduplicated by URI.
fn grounding_sources(data: &serde_json::Value) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    let Some(chunks) = data["candidates"][0]["groundingMetadata"]["groundingChunks"].as_array()
    else {
        return sources;
    };
    for chunk in chunks {
        let (Some(uri), Some(title)) = (chunk["web"]["uri"].as_str(), chunk["web"]["title"].as_str())
        else {
            continue;
        };
        if !sources.iter().any(|s| s.uri == uri) {
            sources.push(Source {
                uri: uri.to_string(),
                title: title.to_string(),
            });
        }
    }
    sources
}

fn sources_section(sources: &[Source]) -> String {
    let links: Vec<String> = sources
        .iter()
        .map(|s| format!("[{}]({})", s.title, s.uri))
        .collect();
    format!("\n\n---\n**Sources:**\n{}", links.join(" • "))
}

fn delta_frame(content: &str) -> Bytes {
    let frame = json!({
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    });
    Bytes::from(format!("data: {frame}\n\n"))
}

/// Re-emit a complete answer as OpenAI-shaped SSE frames, with a short pause
/// between frames, followed by the sources frame and `[DONE]`.
fn synthesize_stream(text: String, sources: Vec<Source>) -> ByteStream {
    let chars: Vec<char> = text.chars().collect();
    let mut frames: Vec<Bytes> = chars
        .chunks(CHUNK_CHARS)
        .map(|c| delta_frame(&c.iter().collect::<String>()))
        .collect();
    if !sources.is_empty() {
        frames.push(delta_frame(&sources_section(&sources)));
    }
    frames.push(Bytes::from_static(b"data: [DONE]\n\n"));

    let stream = futures::stream::iter(frames).then(|frame| async move {
        tokio::time::sleep(CHUNK_DELAY).await;
        Ok::<_, anyhow::Error>(frame)
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn grounded_reply() -> serde_json::Value {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "The weather in Oslo today is mild and sunny."}]},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://yr.no/oslo", "title": "yr.no"}},
                        {"web": {"uri": "https://yr.no/oslo", "title": "yr.no"}},
                        {"web": {"uri": "https://met.no", "title": "met.no"}},
                        {"retrievedContext": {"uri": "gs://bucket"}}
                    ]
                }
            }]
        })
    }

    fn request(stream: bool) -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".into(),
            messages: vec![
                ChatMessage::new(Role::System, "answer briefly"),
                ChatMessage::new(Role::User, "Weather in Oslo?"),
            ],
            temperature: 0.7,
            stream,
            web_search: true,
        }
    }

    async fn server_with_reply() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "g-test"))
            .and(body_partial_json(json!({
                "tools": [{"google_search": {}}],
                "generationConfig": {"topK": 1, "maxOutputTokens": 8196},
                "contents": [{"role": "user", "parts": [{"text": "Weather in Oslo?"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(grounded_reply()))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    fn provider(server: &MockServer) -> GeminiProvider {
        GeminiProvider::new(
            reqwest::Client::new(),
            format!("{}/v1beta", server.uri()),
            "g-test".into(),
        )
    }

    #[tokio::test]
    async fn streaming_is_synthesized_in_chunks() {
        let server = server_with_reply().await;
        let ProviderReply::Stream(bytes) = provider(&server).send(&request(true)).await.unwrap()
        else {
            panic!("expected stream");
        };
        let fragments: Vec<String> = sse::decode(bytes).collect().await;

        // 44 characters of answer: 20 + 20 + 4, then one sources frame.
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0], "The weather in Oslo ");
        assert_eq!(
            fragments[3],
            "\n\n---\n**Sources:**\n[yr.no](https://yr.no/oslo) • [met.no](https://met.no)"
        );
    }

    #[tokio::test]
    async fn non_streaming_appends_sources() {
        let server = server_with_reply().await;
        let ProviderReply::Complete(c) = provider(&server).send(&request(false)).await.unwrap()
        else {
            panic!("expected complete reply");
        };
        let content = c.content().unwrap();
        assert!(content.starts_with("The weather in Oslo today is mild and sunny."));
        assert!(content.ends_with("[met.no](https://met.no)"));
    }

    #[test]
    fn system_prompt_becomes_instruction() {
        let provider = GeminiProvider::new(reqwest::Client::new(), "http://x".into(), "k".into());
        let mut req = request(false);
        req.web_search = false;
        let body = provider.build_body(&req).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "answer briefly");
        assert!(body.get("tools").is_none());
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn request_without_user_turn_is_rejected() {
        let provider = GeminiProvider::new(reqwest::Client::new(), "http://x".into(), "k".into());
        let mut req = request(false);
        req.messages.retain(|m| m.role == Role::System);
        assert!(provider.build_body(&req).is_err());
    }

    #[tokio::test]
    async fn multibyte_text_chunks_on_char_boundaries() {
        let text = "Привет".repeat(5);
        let fragments: Vec<String> = sse::decode(synthesize_stream(text, Vec::new()))
            .collect()
            .await;
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].chars().count(), 20);
        assert_eq!(fragments[1].chars().count(), 10);
    }
}
