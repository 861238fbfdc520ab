//! The two owning scopes: single-chat conversations plus settings, and arena
//! conversations. Each owns its own conversation list; ids never overlap.

use chrono::Utc;
use colloquy_config::Settings;
use serde::Serialize;

use crate::conversation::{Conversation, ConversationError, Message, DEFAULT_TITLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    AwaitingResponse,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Chat,
    Arena,
}

/// An ordered conversation collection (newest first) with a current
/// selection.
#[derive(Debug, Clone)]
pub struct ConversationList {
    kind: ScopeKind,
    conversations: Vec<Conversation>,
    current: Option<String>,
    welcome: Option<String>,
}

impl ConversationList {
    pub fn new(kind: ScopeKind, welcome: Option<String>) -> Self {
        Self {
            kind,
            conversations: Vec::new(),
            current: None,
            welcome,
        }
    }

    /// Rehydrate from persisted conversations, selecting the first one.
    /// Conversations that belong to the other scope are dropped.
    pub fn restore(&mut self, conversations: Vec<Conversation>) {
        let is_arena = self.kind == ScopeKind::Arena;
        self.conversations = conversations
            .into_iter()
            .filter(|c| c.is_arena == is_arena && self.owns_id(&c.id))
            .collect();
        self.current = self.conversations.first().map(|c| c.id.clone());
    }

    fn owns_id(&self, id: &str) -> bool {
        match self.kind {
            ScopeKind::Chat => !id.starts_with("arena-"),
            ScopeKind::Arena => id.starts_with("arena-"),
        }
    }

    fn next_id(&self) -> String {
        let id = uuid::Uuid::new_v4();
        match self.kind {
            ScopeKind::Chat => id.to_string(),
            ScopeKind::Arena => format!("arena-{id}"),
        }
    }

    /// Start a fresh conversation, put it first and select it.
    pub fn create(&mut self) -> &mut Conversation {
        let conversation = match self.kind {
            ScopeKind::Chat => {
                let mut c = Conversation::new(self.next_id(), DEFAULT_TITLE, false);
                if let Some(welcome) = &self.welcome {
                    c.add_message(Message::assistant(welcome.clone()));
                }
                c
            }
            ScopeKind::Arena => {
                let title = format!("Arena Battle {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
                Conversation::new(self.next_id(), title, true)
            }
        };
        tracing::debug!(id = %conversation.id, kind = ?self.kind, "created conversation");
        self.current = Some(conversation.id.clone());
        self.conversations.insert(0, conversation);
        &mut self.conversations[0]
    }

    pub fn select(&mut self, id: &str) -> Result<(), ConversationError> {
        if !self.conversations.iter().any(|c| c.id == id) {
            return Err(ConversationError::ConversationNotFound(id.to_string()));
        }
        self.current = Some(id.to_string());
        Ok(())
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        let id = self.current.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn current_or_create(&mut self) -> &mut Conversation {
        let idx = self
            .current
            .as_deref()
            .and_then(|id| self.conversations.iter().position(|c| c.id == id));
        match idx {
            Some(idx) => &mut self.conversations[idx],
            None => self.create(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Conversation, ConversationError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ConversationError::ConversationNotFound(id.to_string()))
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn rename(&mut self, id: &str, title: &str) -> Result<(), ConversationError> {
        self.get_mut(id)?.rename(title);
        Ok(())
    }

    /// Remove a conversation. If it was current, the first remaining one is
    /// selected; a chat scope left empty starts a fresh conversation.
    pub fn delete(&mut self, id: &str) -> Result<(), ConversationError> {
        let idx = self
            .conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ConversationError::ConversationNotFound(id.to_string()))?;
        self.conversations.remove(idx);

        if self.current.as_deref() == Some(id) {
            self.current = self.conversations.first().map(|c| c.id.clone());
        }
        if self.conversations.is_empty() && self.kind == ScopeKind::Chat {
            self.create();
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.current = None;
        if self.kind == ScopeKind::Chat {
            self.create();
        }
    }
}

/// Single-chat state: conversations, settings and the request phase.
#[derive(Debug, Clone)]
pub struct ChatScope {
    pub conversations: ConversationList,
    pub settings: Settings,
    pub phase: Phase,
}

impl ChatScope {
    pub fn new(settings: Settings, welcome: Option<String>) -> Self {
        Self {
            conversations: ConversationList::new(ScopeKind::Chat, welcome),
            settings,
            phase: Phase::Idle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }
}

/// Arena state: conversations plus one loading flag per model slot.
#[derive(Debug, Clone)]
pub struct ArenaScope {
    pub conversations: ConversationList,
    pub loading: [bool; 2],
}

impl Default for ArenaScope {
    fn default() -> Self {
        Self {
            conversations: ConversationList::new(ScopeKind::Arena, None),
            loading: [false, false],
        }
    }
}

impl ArenaScope {
    pub fn is_busy(&self) -> bool {
        self.loading.iter().any(|l| *l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_list() -> ConversationList {
        ConversationList::new(ScopeKind::Chat, Some("Hello!".into()))
    }

    #[test]
    fn create_prepends_and_selects_with_welcome() {
        let mut list = chat_list();
        let first = list.create().id.clone();
        let second = list.create().id.clone();
        assert_eq!(list.list()[0].id, second);
        assert_eq!(list.current_id(), Some(second.as_str()));
        assert_ne!(first, second);

        let current = list.current().unwrap();
        assert_eq!(current.title, DEFAULT_TITLE);
        assert_eq!(current.messages().len(), 1);
        assert_eq!(current.messages()[0].content, "Hello!");
    }

    #[test]
    fn arena_ids_are_prefixed_and_untitled_differently() {
        let mut arena = ArenaScope::default();
        let convo = arena.conversations.create();
        assert!(convo.id.starts_with("arena-"));
        assert!(convo.is_arena);
        assert!(convo.title.starts_with("Arena Battle "));
        assert!(convo.messages().is_empty());
    }

    #[test]
    fn delete_current_selects_next_or_recreates() {
        let mut list = chat_list();
        let a = list.create().id.clone();
        let b = list.create().id.clone();

        list.delete(&b).unwrap();
        assert_eq!(list.current_id(), Some(a.as_str()));

        list.delete(&a).unwrap();
        assert_eq!(list.list().len(), 1);
        assert_ne!(list.current_id(), Some(a.as_str()));
        assert!(list.delete("nope").is_err());
    }

    #[test]
    fn clear_leaves_one_fresh_chat() {
        let mut list = chat_list();
        list.create();
        list.create();
        list.clear();
        assert_eq!(list.list().len(), 1);

        let mut arena = ConversationList::new(ScopeKind::Arena, None);
        arena.create();
        arena.clear();
        assert!(arena.list().is_empty());
        assert!(arena.current().is_none());
    }

    #[test]
    fn restore_keeps_scopes_disjoint() {
        let chat = Conversation::new("c-1", DEFAULT_TITLE, false);
        let stray = Conversation::new("arena-x", "Arena Battle", true);

        let mut list = chat_list();
        list.restore(vec![chat.clone(), stray.clone()]);
        assert_eq!(list.list().len(), 1);
        assert_eq!(list.current_id(), Some("c-1"));

        let mut arena = ConversationList::new(ScopeKind::Arena, None);
        arena.restore(vec![chat, stray]);
        assert_eq!(arena.current_id(), Some("arena-x"));
    }

    #[test]
    fn select_and_rename() {
        let mut list = chat_list();
        let a = list.create().id.clone();
        list.create();
        list.select(&a).unwrap();
        list.rename(&a, "Trip planning").unwrap();
        assert_eq!(list.current().unwrap().title, "Trip planning");
        assert!(list.select("missing").is_err());
    }
}
