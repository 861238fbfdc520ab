use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod settings;

pub use settings::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

fn default_search_model() -> String {
    "gemini-2.5-pro-exp-03-25".to_string()
}

fn default_welcome_message() -> String {
    "Hello! I'm your AI assistant. How can I help you today?".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Seeds `Settings::provider` when no settings have been persisted yet.
    #[serde(default)]
    pub default_provider: Option<ProviderKind>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
    /// Model forced onto the Google provider while web search is on.
    #[serde(default = "default_search_model")]
    pub search_model: String,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            default_model: None,
            system_prompt: None,
            stream_enabled: true,
            search_model: default_search_model(),
            welcome_message: default_welcome_message(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_tts_model() -> String {
    "gpt-4o-mini-tts".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_stt_model() -> String {
    "whisper-large-v3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Overrides the OpenAI base URL used for speech synthesis.
    #[serde(default)]
    pub tts_base_url: Option<String>,
    /// Overrides the Groq base URL used for transcription.
    #[serde(default)]
    pub stt_base_url: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            stt_model: default_stt_model(),
            tts_base_url: None,
            stt_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            tracing::debug!(path = %path.display(), "loading config");
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colloquy")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colloquy")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(Self::config_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        self.ensure_dirs()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn load_project(project_root: &Path) -> Result<Option<Self>> {
        let path = project_root.join(".colloquy").join("config.toml");
        if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read project config")?;
            let config: Config =
                toml::from_str(&content).context("Failed to parse project config")?;
            tracing::info!(path = %path.display(), "applying project config");
            Ok(Some(config))
        } else {
            Ok(None)
        }
    }

    /// Project values win wherever they differ from the built-in defaults.
    pub fn merge(global: &Config, project: &Config) -> Config {
        let provider = {
            let mut merged = global.provider.providers.clone();
            for (k, proj_entry) in &project.provider.providers {
                let base = merged.remove(k).unwrap_or_default();
                merged.insert(k.clone(), merge_provider_entry(&base, proj_entry));
            }
            ProviderConfig { providers: merged }
        };

        let defaults = ChatConfig::default();
        let chat = ChatConfig {
            default_provider: project.chat.default_provider.or(global.chat.default_provider),
            default_model: project
                .chat
                .default_model
                .clone()
                .or_else(|| global.chat.default_model.clone()),
            system_prompt: project
                .chat
                .system_prompt
                .clone()
                .or_else(|| global.chat.system_prompt.clone()),
            stream_enabled: project.chat.stream_enabled && global.chat.stream_enabled,
            search_model: if project.chat.search_model != defaults.search_model {
                project.chat.search_model.clone()
            } else {
                global.chat.search_model.clone()
            },
            welcome_message: if project.chat.welcome_message != defaults.welcome_message {
                project.chat.welcome_message.clone()
            } else {
                global.chat.welcome_message.clone()
            },
            request_timeout_secs: if project.chat.request_timeout_secs
                != defaults.request_timeout_secs
            {
                project.chat.request_timeout_secs
            } else {
                global.chat.request_timeout_secs
            },
        };

        Config {
            provider,
            chat,
            voice: global.voice.clone(),
            storage: StorageConfig {
                data_dir: project
                    .storage
                    .data_dir
                    .clone()
                    .or_else(|| global.storage.data_dir.clone()),
            },
        }
    }

    /// Credential lookup: explicit config entry first, then the provider's
    /// environment variable.
    pub fn api_key(&self, kind: ProviderKind) -> Option<String> {
        self.provider
            .entry(kind.id())
            .and_then(|e| e.api_key.clone())
            .filter(|k| !k.is_empty())
            .or_else(|| {
                std::env::var(kind.def().env_var)
                    .ok()
                    .filter(|k| !k.is_empty())
            })
    }

    pub fn base_url(&self, kind: ProviderKind) -> String {
        self.provider
            .entry(kind.id())
            .and_then(|e| e.base_url.clone())
            .unwrap_or_else(|| kind.def().default_base_url.to_string())
    }
}

fn merge_provider_entry(global: &ProviderEntry, project: &ProviderEntry) -> ProviderEntry {
    ProviderEntry {
        api_key: project.api_key.clone().or_else(|| global.api_key.clone()),
        base_url: project.base_url.clone().or_else(|| global.base_url.clone()),
        model: project.model.clone().or_else(|| global.model.clone()),
    }
}
