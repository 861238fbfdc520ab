use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use colloquy_config::Settings;

use crate::conversation::Conversation;

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const SETTINGS_KEY: &str = "settings";
pub const ARENA_CONVERSATIONS_KEY: &str = "arena_conversations";

/// Key/value store holding serialized JSON blobs.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// One `<key>.json` file per key under a data directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create data directory")?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Missing or unreadable data yields an empty list; the caller starts fresh.
pub fn load_conversations(storage: &dyn Storage, key: &str) -> Vec<Conversation> {
    let raw = match storage.load(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to read conversations");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<Conversation>>(&raw) {
        Ok(mut conversations) => {
            conversations.iter_mut().for_each(Conversation::recount_tokens);
            conversations
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding corrupt conversations");
            Vec::new()
        }
    }
}

pub fn save_conversations(
    storage: &dyn Storage,
    key: &str,
    conversations: &[Conversation],
) -> Result<()> {
    let json = serde_json::to_string(conversations)?;
    storage.save(key, &json)
}

/// Persisted settings overlaid on `base`; corrupt data falls back to `base`.
pub fn load_settings(storage: &dyn Storage, base: &Settings) -> Settings {
    match storage.load(SETTINGS_KEY) {
        Ok(Some(raw)) => Settings::merge_persisted(base, &raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring corrupt settings");
            base.clone()
        }),
        Ok(None) => base.clone(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read settings");
            base.clone()
        }
    }
}

pub fn save_settings(storage: &dyn Storage, settings: &Settings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    storage.save(SETTINGS_KEY, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, DEFAULT_TITLE};
    use colloquy_config::ProviderKind;

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("data"));
        assert_eq!(storage.load(CONVERSATIONS_KEY).unwrap(), None);

        let mut convo = Conversation::new("c1", DEFAULT_TITLE, false);
        convo.add_message(Message::user("Hello"));
        save_conversations(&storage, CONVERSATIONS_KEY, &[convo.clone()]).unwrap();

        assert!(dir.path().join("data/conversations.json").exists());
        let loaded = load_conversations(&storage, CONVERSATIONS_KEY);
        assert_eq!(loaded, vec![convo]);
    }

    #[test]
    fn corrupt_conversations_yield_empty() {
        let storage = MemoryStorage::new();
        storage.save(CONVERSATIONS_KEY, "{oops").unwrap();
        assert!(load_conversations(&storage, CONVERSATIONS_KEY).is_empty());
    }

    #[test]
    fn timestamps_rehydrate_from_iso_strings() {
        let storage = MemoryStorage::new();
        storage
            .save(
                ARENA_CONVERSATIONS_KEY,
                r#"[{"id":"arena-1","title":"Arena Battle","isArena":true,
                    "messages":[{"id":"m1","role":"user","content":"hi","createdAt":"2025-03-01T10:00:00.000Z"}],
                    "createdAt":"2025-03-01T10:00:00.000Z","updatedAt":"2025-03-01T10:05:00Z"}]"#,
            )
            .unwrap();
        let loaded = load_conversations(&storage, ARENA_CONVERSATIONS_KEY);
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].updated_at > loaded[0].created_at);
        assert_eq!(loaded[0].messages()[0].token_count, 1);
    }

    #[test]
    fn settings_merge_and_fallback() {
        let storage = MemoryStorage::new();
        let base = Settings::default();
        assert_eq!(load_settings(&storage, &base), base);

        storage.save(SETTINGS_KEY, r#"{"provider":"openai"}"#).unwrap();
        assert_eq!(load_settings(&storage, &base).provider, ProviderKind::OpenAI);

        storage.save(SETTINGS_KEY, "not json").unwrap();
        assert_eq!(load_settings(&storage, &base), base);
    }
}
