pub mod types;

pub mod anthropic;
pub mod flowise;
pub mod gemini;
pub mod neura;
pub mod openai;
pub mod sse;

mod error;

pub use error::ProviderError;
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use colloquy_config::{Config, ProviderKind};
use futures::stream::StreamExt;

/// A chat backend. Given a normalized request it returns either the raw
/// response bytes (to be run through [`sse::decode`]) or a complete payload.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn send(&self, request: &ChatRequest) -> Result<ProviderReply>;
}

pub fn create_provider(kind: ProviderKind, config: &Config) -> Result<Arc<dyn Provider>> {
    let api_key = resolve_key(kind, config)?;
    let base_url = config.base_url(kind);
    let client = http_client(config.chat.request_timeout_secs);

    tracing::debug!(provider = %kind, url = %base_url, "creating provider");

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Groq | ProviderKind::OpenAI | ProviderKind::OpenRouter => Arc::new(
            openai::OpenAICompatibleProvider::new(kind, client, base_url, api_key),
        ),
        ProviderKind::NeuraRouter => {
            Arc::new(neura::NeuraRouterProvider::new(client, base_url, api_key))
        }
        ProviderKind::Anthropic => {
            Arc::new(anthropic::AnthropicProvider::new(client, base_url, api_key))
        }
        ProviderKind::Google => Arc::new(gemini::GeminiProvider::new(client, base_url, api_key)),
        ProviderKind::Flowise => {
            let key = (!api_key.is_empty()).then_some(api_key);
            Arc::new(flowise::FlowiseProvider::new(client, base_url, key))
        }
    };
    Ok(provider)
}

/// Lookup seam between the orchestrator and the concrete adapters, so tests
/// can substitute scripted providers.
pub trait ProviderRegistry: Send + Sync {
    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>>;
}

/// Builds adapters on demand from the loaded process configuration.
pub struct ConfiguredProviders {
    config: Config,
}

impl ConfiguredProviders {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ProviderRegistry for ConfiguredProviders {
    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>> {
        create_provider(kind, &self.config)
    }
}

fn resolve_key(kind: ProviderKind, config: &Config) -> Result<String> {
    match config.api_key(kind) {
        Some(key) => Ok(key),
        None if !kind.def().requires_key => Ok(String::new()),
        None => Err(ProviderError::MissingApiKey(kind.id()).into()),
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `timeout_secs` bounds each read, not the whole response, so long streams
/// are not cut off mid-reply.
pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

pub(crate) fn byte_stream(resp: reqwest::Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(anyhow::Error::from)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_config::ProviderEntry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn slow_stream_outlives_request_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            for part in ["a", "b", "c", "d"] {
                tokio::time::sleep(Duration::from_millis(400)).await;
                let frame = format!("data: {{\"chunk\":\"{part}\"}}\n");
                socket.write_all(frame.as_bytes()).await.unwrap();
            }
        });

        let resp = http_client(1)
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(sse::collect_text(byte_stream(resp)).await, "abcd");
    }

    fn config_with_key(kind: ProviderKind) -> Config {
        let mut config = Config::default();
        config.provider.providers.insert(
            kind.id().to_string(),
            ProviderEntry {
                api_key: Some("test-key".into()),
                base_url: None,
                model: None,
            },
        );
        config
    }

    #[test]
    fn factory_maps_every_kind() {
        for kind in ProviderKind::ALL {
            let provider = create_provider(*kind, &config_with_key(*kind)).unwrap();
            assert_eq!(provider.kind(), *kind);
        }
    }

    #[test]
    fn flowise_needs_no_key() {
        let provider = create_provider(ProviderKind::Flowise, &Config::default()).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Flowise);
    }

    #[test]
    fn missing_key_fails_before_any_request() {
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        // An empty configured key counts as missing.
        let mut config = Config::default();
        config.provider.providers.insert(
            "anthropic".into(),
            ProviderEntry {
                api_key: Some(String::new()),
                base_url: None,
                model: None,
            },
        );
        let err = create_provider(ProviderKind::Anthropic, &config)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::MissingApiKey("anthropic"))
        ));
    }
}
