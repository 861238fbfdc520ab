use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use colloquy_config::{Config, ProviderKind};
use colloquy_provider::ProviderError;
use regex::Regex;
use serde_json::json;

const MAX_SPOKEN_WORDS: usize = 250;
const MAX_SPOKEN_CHARS: usize = 4000;
const TRUNCATION_NOTE: &str = "... (continue reading for more)";

/// Speech synthesis and transcription. Both are best-effort collaborators.
#[async_trait]
pub trait Speech: Send + Sync {
    async fn text_to_speech(&self, text: &str) -> Result<Vec<u8>>;

    async fn speech_to_text(&self, audio: Vec<u8>, file_name: &str) -> Result<String>;
}

/// OpenAI `/audio/speech` for synthesis, Groq Whisper for transcription.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    tts_base_url: String,
    tts_api_key: Option<String>,
    tts_model: String,
    voice: String,
    stt_base_url: String,
    stt_api_key: Option<String>,
    stt_model: String,
}

impl OpenAiSpeech {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            tts_base_url: config
                .voice
                .tts_base_url
                .clone()
                .unwrap_or_else(|| config.base_url(ProviderKind::OpenAI)),
            tts_api_key: config.api_key(ProviderKind::OpenAI),
            tts_model: config.voice.tts_model.clone(),
            voice: config.voice.tts_voice.clone(),
            stt_base_url: config
                .voice
                .stt_base_url
                .clone()
                .unwrap_or_else(|| config.base_url(ProviderKind::Groq)),
            stt_api_key: config.api_key(ProviderKind::Groq),
            stt_model: config.voice.stt_model.clone(),
        }
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".mp3") {
        "audio/mpeg"
    } else if lower.ends_with(".m4a") {
        "audio/mp4"
    } else if lower.ends_with(".ogg") {
        "audio/ogg"
    } else if lower.ends_with(".webm") {
        "audio/webm"
    } else if lower.ends_with(".flac") {
        "audio/flac"
    } else {
        "audio/wav"
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_http(status.as_u16(), body, None).into())
}

#[async_trait]
impl Speech for OpenAiSpeech {
    async fn text_to_speech(&self, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            anyhow::bail!("Text is required for speech synthesis");
        }
        let key = self
            .tts_api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey("openai"))?;

        let url = format!("{}/audio/speech", self.tts_base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {key}"))
            .json(&json!({
                "model": self.tts_model,
                "voice": self.voice,
                "input": text,
            }))
            .send()
            .await
            .context("Speech synthesis request failed")?;
        let audio = check_status(resp).await?.bytes().await?;
        tracing::debug!(bytes = audio.len(), voice = %self.voice, "synthesized speech");
        Ok(audio.to_vec())
    }

    async fn speech_to_text(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        let key = self
            .stt_api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey("groq"))?;

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.stt_model.clone())
            .text("response_format", "text");

        let url = format!(
            "{}/audio/transcriptions",
            self.stt_base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {key}"))
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;
        let body = check_status(resp)
            .await?
            .text()
            .await
            .context("Failed to read transcription")?;
        Ok(body.trim().to_string())
    }
}

/// Read an audio file from disk and transcribe it.
pub async fn transcribe_file(speech: &dyn Speech, path: &Path) -> Result<String> {
    let audio = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read audio file {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio.wav".to_string());
    speech.speech_to_text(audio, &file_name).await
}

struct SpeechPatterns {
    fence: Regex,
    html: Regex,
    image: Regex,
    link: Regex,
    markers: Regex,
    blank_lines: Regex,
}

fn patterns() -> &'static SpeechPatterns {
    static PATTERNS: OnceLock<SpeechPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SpeechPatterns {
        fence: Regex::new(r"```[\s\S]*?```").expect("static regex"),
        html: Regex::new(r"<[^>]*>").expect("static regex"),
        image: Regex::new(r"!\[(.*?)\]\(.*?\)").expect("static regex"),
        link: Regex::new(r"\[(.*?)\]\(.*?\)").expect("static regex"),
        markers: Regex::new(r"\*\*|\*|__|#").expect("static regex"),
        blank_lines: Regex::new(r"\n\n+").expect("static regex"),
    })
}

/// Reduce a markdown reply to something worth reading aloud: no code, markup
/// or link targets, at most 250 words and 4000 characters.
pub fn speech_text(reply: &str) -> String {
    let p = patterns();
    let text = p.fence.replace_all(reply, "");
    let text = p.html.replace_all(&text, "");
    let text = p.image.replace_all(&text, "Image: $1");
    let text = p.link.replace_all(&text, "$1");
    let text = p.markers.replace_all(&text, "");
    let text = p.blank_lines.replace_all(&text, "\n\n");
    let text = text.trim();

    let words: Vec<&str> = text.split_whitespace().collect();
    let mut limited = words
        .iter()
        .take(MAX_SPOKEN_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > MAX_SPOKEN_WORDS {
        limited.push_str(TRUNCATION_NOTE);
    }

    if limited.chars().count() > MAX_SPOKEN_CHARS {
        limited = limited.chars().take(MAX_SPOKEN_CHARS).collect();
    }
    limited
}

/// Writes synthesized clips to `<data_dir>/audio/<message_id>.mp3`.
#[derive(Debug, Clone)]
pub struct AudioStore {
    dir: PathBuf,
}

impl AudioStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("audio"),
        }
    }

    /// Store a clip and return a `file://` URL for it.
    pub async fn store(&self, message_id: &str, audio: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create audio directory")?;
        let path = self.dir.join(format!("{message_id}.mp3"));
        tokio::fs::write(&path, audio)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        let url = url::Url::from_file_path(&absolute)
            .map_err(|_| anyhow::anyhow!("cannot build a file URL for {}", absolute.display()))?;
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_config::ProviderEntry;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn speech_text_strips_markup() {
        let reply = "# Title\n\nSee **this** [guide](https://x.io) and ![chart](c.png).\n\n\n\n\
                     ```rust\nfn main() {}\n```\n<b>done</b>";
        assert_eq!(
            speech_text(reply),
            "Title See this guide and Image: chart. done"
        );
    }

    #[test]
    fn speech_text_limits_words() {
        let reply = "word ".repeat(300);
        let spoken = speech_text(&reply);
        assert!(spoken.ends_with(TRUNCATION_NOTE));
        assert_eq!(
            spoken.trim_end_matches(TRUNCATION_NOTE).split(' ').count(),
            MAX_SPOKEN_WORDS
        );
    }

    #[test]
    fn speech_text_limits_chars() {
        let reply = "x".repeat(5000);
        assert_eq!(speech_text(&reply).chars().count(), MAX_SPOKEN_CHARS);
    }

    fn config_for(server: &MockServer) -> Config {
        let mut config = Config::default();
        for kind in ["openai", "groq"] {
            config.provider.providers.insert(
                kind.into(),
                ProviderEntry {
                    api_key: Some(format!("{kind}-key")),
                    base_url: Some(format!("{}/v1", server.uri())),
                    model: None,
                },
            );
        }
        config
    }

    #[tokio::test]
    async fn synthesizes_with_configured_voice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(header("authorization", "Bearer openai-key"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini-tts",
                "voice": "alloy",
                "input": "Hi there"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let speech = OpenAiSpeech::from_config(&config_for(&server));
        assert_eq!(speech.text_to_speech("Hi there").await.unwrap(), vec![1, 2, 3]);
        assert!(speech.text_to_speech("   ").await.is_err());
    }

    #[tokio::test]
    async fn transcribes_via_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .and(header("authorization", "Bearer groq-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(" what time is it \n"))
            .expect(1)
            .mount(&server)
            .await;

        let speech = OpenAiSpeech::from_config(&config_for(&server));
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("note.webm");
        std::fs::write(&clip, b"fake audio").unwrap();
        assert_eq!(
            transcribe_file(&speech, &clip).await.unwrap(),
            "what time is it"
        );
    }

    #[tokio::test]
    async fn audio_store_returns_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = AudioStore::new(dir.path());
        let url = store.store("m1", b"mp3").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/audio/m1.mp3"));
        assert_eq!(std::fs::read(dir.path().join("audio/m1.mp3")).unwrap(), b"mp3");
    }
}
