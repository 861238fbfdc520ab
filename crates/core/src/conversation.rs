use chrono::{DateTime, Utc};
use colloquy_provider::{ChatMessage, Role};
use serde::{Deserialize, Serialize};

use crate::tokens::count_tokens;

pub const DEFAULT_TITLE: &str = "New Conversation";
const TITLE_CHARS: usize = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("message index {index} is out of range (conversation has {len} messages)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("only user messages can be edited (message {index} is {role})")]
    NotUserMessage { index: usize, role: &'static str },

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_b: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            token_count: count_tokens(&content),
            content,
            created_at: Utc::now(),
            audio_url: None,
            model: None,
            model_a: None,
            model_b: None,
            provider_a: None,
            provider_b: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Label an arena reply with the slot (0 = A, 1 = B) that produced it.
    pub fn with_arena_slot(mut self, slot: usize, model: &str, provider: &str) -> Self {
        self.model = Some(model.to_string());
        if slot == 0 {
            self.model_a = Some(model.to_string());
            self.provider_a = Some(provider.to_string());
        } else {
            self.model_b = Some(model.to_string());
            self.provider_b = Some(provider.to_string());
        }
        self
    }

    fn replace_content(&mut self, content: String) {
        self.token_count = count_tokens(&content);
        self.content = content;
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub is_arena: bool,
    #[serde(default)]
    messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the title was chosen by hand; stops auto-derivation.
    #[serde(default)]
    title_locked: bool,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>, is_arena: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            is_arena,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title_locked: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Bump `updated_at`, never moving it backwards.
    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn message_mut(&mut self, id: &str) -> Result<&mut Message, ConversationError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ConversationError::MessageNotFound(id.to_string()))
    }

    /// Append a message and return its id. The first user message names an
    /// untitled conversation.
    pub fn add_message(&mut self, mut message: Message) -> String {
        message.token_count = count_tokens(&message.content);
        if message.role == Role::User
            && !self.title_locked
            && self.title == DEFAULT_TITLE
            && !self.messages.iter().any(|m| m.role == Role::User)
        {
            self.title = derive_title(&message.content);
        }
        let id = message.id.clone();
        self.messages.push(message);
        self.touch();
        id
    }

    /// Replace a user message and drop everything after it. Afterwards the
    /// conversation holds exactly `index + 1` messages.
    pub fn edit_message(&mut self, index: usize, content: &str) -> Result<(), ConversationError> {
        let len = self.messages.len();
        let message = self
            .messages
            .get_mut(index)
            .ok_or(ConversationError::IndexOutOfRange { index, len })?;
        if message.role != Role::User {
            return Err(ConversationError::NotUserMessage {
                index,
                role: message.role.as_str(),
            });
        }
        message.replace_content(content.to_string());
        self.messages.truncate(index + 1);
        self.touch();
        Ok(())
    }

    pub fn append_stream_chunk(
        &mut self,
        message_id: &str,
        fragment: &str,
    ) -> Result<(), ConversationError> {
        let message = self.message_mut(message_id)?;
        message.content.push_str(fragment);
        message.token_count = count_tokens(&message.content);
        self.touch();
        Ok(())
    }

    pub fn set_content(
        &mut self,
        message_id: &str,
        content: String,
    ) -> Result<(), ConversationError> {
        self.message_mut(message_id)?.replace_content(content);
        self.touch();
        Ok(())
    }

    pub fn attach_audio(
        &mut self,
        message_id: &str,
        url: String,
    ) -> Result<(), ConversationError> {
        self.message_mut(message_id)?.audio_url = Some(url);
        self.touch();
        Ok(())
    }

    /// Token counts are derived; recompute them after loading from storage.
    pub fn recount_tokens(&mut self) {
        for message in &mut self.messages {
            message.token_count = count_tokens(&message.content);
        }
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.title_locked = true;
        self.touch();
    }

    /// The most recent `limit` non-system messages before `end`.
    pub fn history_window(&self, end: usize, limit: usize) -> Vec<&Message> {
        let end = end.min(self.messages.len());
        let prior: Vec<&Message> = self.messages[..end]
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let skip = prior.len().saturating_sub(limit);
        prior.into_iter().skip(skip).collect()
    }
}

fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() > TITLE_CHARS {
        let cut: String = trimmed.chars().take(TITLE_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo_with(n: usize) -> Conversation {
        let mut c = Conversation::new("c1", DEFAULT_TITLE, false);
        for i in 0..n {
            let msg = if i % 2 == 0 {
                Message::user(format!("question {i}"))
            } else {
                Message::assistant(format!("answer {i}"))
            };
            c.add_message(msg);
        }
        c
    }

    #[test]
    fn first_user_message_sets_title() {
        let mut c = Conversation::new("c1", DEFAULT_TITLE, false);
        c.add_message(Message::assistant("Hello! How can I help?"));
        assert_eq!(c.title, DEFAULT_TITLE);

        c.add_message(Message::user("What is the tallest mountain in the world today?"));
        assert_eq!(c.title, "What is the tallest mountain i...");

        c.add_message(Message::user("second"));
        assert_eq!(c.title, "What is the tallest mountain i...");
    }

    #[test]
    fn renamed_title_is_kept() {
        let mut c = Conversation::new("c1", DEFAULT_TITLE, false);
        c.rename(DEFAULT_TITLE);
        c.add_message(Message::user("short"));
        assert_eq!(c.title, DEFAULT_TITLE);
    }

    #[test]
    fn edit_truncates_to_index_plus_one() {
        let mut c = convo_with(6);
        c.edit_message(2, "rewritten").unwrap();
        assert_eq!(c.messages().len(), 3);
        assert_eq!(c.messages()[2].content, "rewritten");
        assert_eq!(c.messages()[2].token_count, 1);
    }

    #[test]
    fn edit_rejects_bad_targets() {
        let mut c = convo_with(3);
        assert_eq!(
            c.edit_message(1, "x"),
            Err(ConversationError::NotUserMessage { index: 1, role: "assistant" })
        );
        assert_eq!(
            c.edit_message(9, "x"),
            Err(ConversationError::IndexOutOfRange { index: 9, len: 3 })
        );
        assert_eq!(c.messages().len(), 3);
    }

    #[test]
    fn stream_chunks_accumulate_with_token_count() {
        let mut c = convo_with(1);
        let id = c.add_message(Message::assistant(""));
        c.append_stream_chunk(&id, "Hel").unwrap();
        c.append_stream_chunk(&id, "lo world").unwrap();
        let msg = c.message(&id).unwrap();
        assert_eq!(msg.content, "Hello world");
        assert_eq!(msg.token_count, 2);
        assert!(c.append_stream_chunk("missing", "x").is_err());
    }

    #[test]
    fn updated_at_never_precedes_created_at() {
        let mut c = convo_with(2);
        let before = c.updated_at;
        let id = c.messages()[1].id.clone();
        c.attach_audio(&id, "file:///a.mp3".into()).unwrap();
        assert!(c.updated_at >= before);
        assert!(c.updated_at >= c.created_at);
    }

    #[test]
    fn history_window_takes_most_recent() {
        let c = convo_with(9);
        let window = c.history_window(9, 4);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["answer 5", "question 6", "answer 7", "question 8"]);

        let before_edit = c.history_window(3, 10);
        assert_eq!(before_edit.len(), 3);
    }

    #[test]
    fn persisted_shape_uses_camel_case() {
        let c = convo_with(1);
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("updatedAt").is_some());
        assert!(json["messages"][0].get("tokenCount").is_some());
        assert!(json["messages"][0].get("audioUrl").is_none());

        let back: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
