use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Groq,
    #[serde(rename = "openai")]
    OpenAI,
    Flowise,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "neurarouter")]
    NeuraRouter,
    #[serde(alias = "claude")]
    Anthropic,
    Google,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider: {0} (use groq, openai, flowise, openrouter, neurarouter, anthropic, or google)")]
pub struct UnknownProvider(pub String);

impl ProviderKind {
    pub const ALL: &[ProviderKind] = &[
        ProviderKind::Groq,
        ProviderKind::OpenAI,
        ProviderKind::Flowise,
        ProviderKind::OpenRouter,
        ProviderKind::NeuraRouter,
        ProviderKind::Anthropic,
        ProviderKind::Google,
    ];

    pub fn id(self) -> &'static str {
        self.def().id
    }

    pub fn def(self) -> &'static ProviderDef {
        match self {
            ProviderKind::Groq => &BUILT_IN_PROVIDERS[0],
            ProviderKind::OpenAI => &BUILT_IN_PROVIDERS[1],
            ProviderKind::Flowise => &BUILT_IN_PROVIDERS[2],
            ProviderKind::OpenRouter => &BUILT_IN_PROVIDERS[3],
            ProviderKind::NeuraRouter => &BUILT_IN_PROVIDERS[4],
            ProviderKind::Anthropic => &BUILT_IN_PROVIDERS[5],
            ProviderKind::Google => &BUILT_IN_PROVIDERS[6],
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = UnknownProvider;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "openai" => Ok(ProviderKind::OpenAI),
            "flowise" => Ok(ProviderKind::Flowise),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "neurarouter" | "neura" => Ok(ProviderKind::NeuraRouter),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderDef {
    pub id: &'static str,
    pub name: &'static str,
    pub env_var: &'static str,
    /// For `flowise` this is the full prediction endpoint, chatflow id included.
    pub default_base_url: &'static str,
    pub requires_key: bool,
}

pub const BUILT_IN_PROVIDERS: &[ProviderDef] = &[
    ProviderDef { id: "groq", name: "Groq", env_var: "GROQ_API_KEY",
                  default_base_url: "https://api.groq.com/openai/v1", requires_key: true },
    ProviderDef { id: "openai", name: "OpenAI", env_var: "OPENAI_API_KEY",
                  default_base_url: "https://api.openai.com/v1", requires_key: true },
    ProviderDef { id: "flowise", name: "Flowise", env_var: "FLOWISE_API_KEY",
                  default_base_url: "http://localhost:3000/api/v1/prediction", requires_key: false },
    ProviderDef { id: "openrouter", name: "OpenRouter", env_var: "OPENROUTER_API_KEY",
                  default_base_url: "https://openrouter.ai/api/v1", requires_key: true },
    ProviderDef { id: "neurarouter", name: "Neura Router", env_var: "NEURA_ROUTER_API_KEY",
                  default_base_url: "https://api.meetneura.ai/v1", requires_key: true },
    ProviderDef { id: "anthropic", name: "Anthropic", env_var: "ANTHROPIC_API_KEY",
                  default_base_url: "https://api.anthropic.com/v1", requires_key: true },
    ProviderDef { id: "google", name: "Google Gemini", env_var: "GOOGLE_API_KEY",
                  default_base_url: "https://generativelanguage.googleapis.com/v1beta", requires_key: true },
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    #[default]
    Minimal,
    Vibrant,
    Elegant,
}

impl Template {
    pub const ALL: &[Template] = &[Template::Minimal, Template::Vibrant, Template::Elegant];

    pub fn name(self) -> &'static str {
        match self {
            Template::Minimal => "minimal",
            Template::Vibrant => "vibrant",
            Template::Elegant => "elegant",
        }
    }

    /// Unknown names fall back to `Minimal`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "vibrant" => Template::Vibrant,
            "elegant" => Template::Elegant,
            _ => Template::Minimal,
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub const DEFAULT_MODEL: &str = "deepseek-r1-distill-llama-70b";
pub const DEFAULT_GOOGLE_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_ARENA_MODEL: &str = "openrouter/deepseek-r1-0528:free";

fn default_provider() -> ProviderKind {
    ProviderKind::Groq
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_reasoning_format() -> String {
    "parsed".to_string()
}

fn default_context_window_size() -> usize {
    5
}

fn default_arena_provider() -> ProviderKind {
    ProviderKind::NeuraRouter
}

fn default_arena_model() -> String {
    DEFAULT_ARENA_MODEL.to_string()
}

/// User-facing chat settings. Persisted as JSON with camelCase keys; every
/// field carries a serde default so older persisted shapes still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
    #[serde(default = "default_reasoning_format")]
    pub reasoning_format: String,
    #[serde(default)]
    pub template: Template,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub system_prompt: String,
    /// Number of user/assistant message pairs sent as history.
    #[serde(default = "default_context_window_size")]
    pub context_window_size: usize,
    #[serde(default)]
    pub web_search_enabled: bool,
    #[serde(default)]
    pub audio_response_enabled: bool,
    #[serde(default)]
    pub arena_mode: bool,
    #[serde(default = "default_arena_provider", rename = "providerA")]
    pub provider_a: ProviderKind,
    #[serde(default = "default_arena_model", rename = "modelA")]
    pub model_a: String,
    #[serde(default = "default_temperature", rename = "temperatureA")]
    pub temperature_a: f32,
    #[serde(default = "default_arena_provider", rename = "providerB")]
    pub provider_b: ProviderKind,
    #[serde(default = "default_arena_model", rename = "modelB")]
    pub model_b: String,
    #[serde(default = "default_temperature", rename = "temperatureB")]
    pub temperature_b: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
            stream_enabled: true,
            reasoning_format: default_reasoning_format(),
            template: Template::default(),
            dark_mode: false,
            system_prompt: String::new(),
            context_window_size: default_context_window_size(),
            web_search_enabled: false,
            audio_response_enabled: false,
            arena_mode: false,
            provider_a: default_arena_provider(),
            model_a: default_arena_model(),
            temperature_a: default_temperature(),
            provider_b: default_arena_provider(),
            model_b: default_arena_model(),
            temperature_b: default_temperature(),
        }
    }
}

/// One side of an arena comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaSlot {
    pub label: &'static str,
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
}

impl Settings {
    /// Hard-coded defaults adjusted by the process config (default provider
    /// and model from `config.toml`).
    pub fn from_config(config: &crate::Config) -> Self {
        let mut settings = Self::default();
        if let Some(provider) = config.chat.default_provider {
            settings.provider = provider;
            if provider == ProviderKind::Google {
                settings.model = DEFAULT_GOOGLE_MODEL.to_string();
            }
        }
        if let Some(model) = &config.chat.default_model {
            settings.model = model.clone();
        }
        if let Some(prompt) = &config.chat.system_prompt {
            settings.system_prompt = prompt.clone();
        }
        settings.stream_enabled = config.chat.stream_enabled;
        settings
    }

    /// Overlay a persisted JSON object on top of `base`, one key at a time.
    /// Keys that are missing, null or of the wrong type keep the base value.
    pub fn merge_persisted(base: &Settings, persisted: &str) -> anyhow::Result<Settings> {
        let overlay: serde_json::Value = serde_json::from_str(persisted)?;
        let Some(source) = overlay.as_object() else {
            anyhow::bail!("persisted settings are not a JSON object");
        };

        let mut merged = base.clone();
        for (key, value) in source {
            if value.is_null() {
                continue;
            }
            let mut candidate = serde_json::to_value(&merged)?;
            if let Some(target) = candidate.as_object_mut() {
                target.insert(key.clone(), value.clone());
            }
            match serde_json::from_value::<Settings>(candidate) {
                Ok(next) => merged = next,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "ignoring invalid persisted setting");
                }
            }
        }
        Ok(merged)
    }

    pub fn arena_slots(&self) -> [ArenaSlot; 2] {
        [
            ArenaSlot {
                label: "Model A",
                provider: self.provider_a,
                model: self.model_a.clone(),
                temperature: self.temperature_a,
            },
            ArenaSlot {
                label: "Model B",
                provider: self.provider_b,
                model: self.model_b.clone(),
                temperature: self.temperature_b,
            },
        ]
    }

    /// Upper bound on prior history messages sent with a request.
    pub fn history_limit(&self) -> usize {
        self.context_window_size.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_round_trip() {
        for kind in ProviderKind::ALL {
            let parsed: ProviderKind = kind.id().parse().unwrap();
            assert_eq!(*kind, parsed, "round-trip failed for {kind}");
        }
    }

    #[test]
    fn claude_alias_maps_to_anthropic() {
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        let kind: ProviderKind = serde_json::from_str("\"claude\"").unwrap();
        assert_eq!(kind, ProviderKind::Anthropic);
        assert!("local-ai".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn old_shape_gets_arena_defaults() {
        let old = r#"{"provider":"openai","model":"gpt-4o","temperature":0.2,"darkMode":true}"#;
        let settings = Settings::merge_persisted(&Settings::default(), old).unwrap();
        assert_eq!(settings.provider, ProviderKind::OpenAI);
        assert_eq!(settings.model, "gpt-4o");
        assert!(settings.dark_mode);
        assert_eq!(settings.provider_a, ProviderKind::NeuraRouter);
        assert_eq!(settings.model_b, DEFAULT_ARENA_MODEL);
        assert_eq!(settings.context_window_size, 5);
        assert!(settings.stream_enabled);
    }

    #[test]
    fn persisted_keys_are_camel_case() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert!(json.get("contextWindowSize").is_some());
        assert!(json.get("providerA").is_some());
        assert!(json.get("audioResponseEnabled").is_some());
    }

    #[test]
    fn one_bad_field_keeps_the_rest() {
        let persisted = r#"{"model":"gpt-4o","temperature":"0.7","darkMode":true,"template":42}"#;
        let settings = Settings::merge_persisted(&Settings::default(), persisted).unwrap();
        assert_eq!(settings.model, "gpt-4o");
        assert!(settings.dark_mode);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.template, Template::Minimal);
    }

    #[test]
    fn non_object_settings_rejected() {
        assert!(Settings::merge_persisted(&Settings::default(), "[1,2]").is_err());
        assert!(Settings::merge_persisted(&Settings::default(), "{not json").is_err());
    }

    #[test]
    fn template_fallback() {
        assert_eq!(Template::from_name("Vibrant"), Template::Vibrant);
        assert_eq!(Template::from_name("neon"), Template::Minimal);
    }

    #[test]
    fn history_limit_is_pairs() {
        let settings = Settings {
            context_window_size: 3,
            ..Default::default()
        };
        assert_eq!(settings.history_limit(), 6);
    }
}
