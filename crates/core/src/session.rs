//! Request orchestration: turns user input into provider requests and folds
//! the replies back into conversation state, for single chat and the
//! two-model arena.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use colloquy_config::{ArenaSlot, Config, ProviderKind, Settings, Template};
use colloquy_provider::{sse, ByteStream, ChatMessage, ChatRequest, ProviderRegistry, ProviderReply, Role};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::conversation::{Conversation, ConversationError, Message};
use crate::normalize::normalize;
use crate::persist::{self, Storage, ARENA_CONVERSATIONS_KEY, CONVERSATIONS_KEY};
use crate::state::{ArenaScope, ChatScope, Phase, ScopeKind};
use crate::theme::{style_scope, StyleScope};
use crate::voice::{speech_text, AudioStore, Speech};

pub const FALLBACK_REPLY: &str = "No response from AI";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("no {0} configured")]
    MissingSetting(&'static str),

    #[error("a response is already in progress")]
    Busy,

    #[error("messages cannot be edited in arena mode")]
    EditInArena,

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Request(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Transient user-facing notification.
    Notice {
        level: NoticeLevel,
        title: String,
        description: String,
    },
    PhaseChanged(Phase),
    MessageAdded {
        conversation_id: String,
        message_id: String,
    },
    Delta {
        conversation_id: String,
        message_id: String,
        fragment: String,
    },
    MessageFinished {
        conversation_id: String,
        message_id: String,
    },
    AudioReady {
        conversation_id: String,
        message_id: String,
        url: String,
    },
    ArenaLoading {
        slot: usize,
        loading: bool,
    },
    SettingsChanged,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Rewrite the user message at this index and regenerate from there.
    pub edited_message_index: Option<usize>,
    /// Return the reply text directly and leave conversation state alone.
    pub return_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message_id: String,
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Response {
        content: String,
    },
    /// `reply` is `None` when the request was cancelled before any answer
    /// arrived.
    Chat {
        conversation_id: String,
        reply: Option<Reply>,
    },
    Arena {
        conversation_id: String,
        replies: [Option<Reply>; 2],
    },
}

/// Speech synthesis plus somewhere to keep the clips.
pub struct Voice {
    pub speech: Arc<dyn Speech>,
    pub store: AudioStore,
}

/// Which scope a request writes into, and how its messages are labelled.
#[derive(Debug, Clone)]
enum Branch {
    Chat {
        model: String,
    },
    Arena {
        slot: usize,
        model: String,
        provider: ProviderKind,
    },
}

impl Branch {
    fn label(&self, message: Message) -> Message {
        match self {
            Branch::Chat { model } => message.with_model(model.as_str()),
            Branch::Arena {
                slot,
                model,
                provider,
            } => message.with_arena_slot(*slot, model, provider.id()),
        }
    }

    fn fallback(&self) -> String {
        match self {
            Branch::Chat { .. } => FALLBACK_REPLY.to_string(),
            Branch::Arena { model, .. } => format!("No response from {model}"),
        }
    }

    fn error_text(&self) -> String {
        match self {
            Branch::Chat { .. } => ERROR_REPLY.to_string(),
            Branch::Arena { model, .. } => {
                format!("Sorry, {model} encountered an error. Please try again.")
            }
        }
    }
}

struct Target {
    provider: ProviderKind,
    model: String,
    web_search: bool,
}

struct Inner {
    config: Config,
    providers: Arc<dyn ProviderRegistry>,
    storage: Arc<dyn Storage>,
    voice: Option<Voice>,
    chat: Mutex<ChatScope>,
    arena: Mutex<ArenaScope>,
    /// In-flight request per scope, indexed by [`cancel_slot`].
    cancel: std::sync::Mutex<[Option<(u64, CancellationToken)>; 2]>,
    request_seq: AtomicU64,
    audio_tasks: std::sync::Mutex<JoinSet<()>>,
    events: broadcast::Sender<ChatEvent>,
}

/// Owns both scopes and drives every request. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    /// Load settings and conversations from `storage`, falling back to
    /// defaults derived from `config`.
    pub fn new(
        config: Config,
        providers: Arc<dyn ProviderRegistry>,
        storage: Arc<dyn Storage>,
        voice: Option<Voice>,
    ) -> Self {
        let settings = persist::load_settings(storage.as_ref(), &Settings::from_config(&config));

        let mut chat = ChatScope::new(settings, Some(config.chat.welcome_message.clone()));
        chat.conversations
            .restore(persist::load_conversations(storage.as_ref(), CONVERSATIONS_KEY));
        if chat.conversations.current().is_none() {
            chat.conversations.create();
        }

        let mut arena = ArenaScope::default();
        arena.conversations.restore(persist::load_conversations(
            storage.as_ref(),
            ARENA_CONVERSATIONS_KEY,
        ));

        tracing::debug!(
            conversations = chat.conversations.list().len(),
            arena_conversations = arena.conversations.list().len(),
            "session restored"
        );

        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                providers,
                storage,
                voice,
                chat: Mutex::new(chat),
                arena: Mutex::new(arena),
                cancel: std::sync::Mutex::new([None, None]),
                request_seq: AtomicU64::new(0),
                audio_tasks: std::sync::Mutex::new(JoinSet::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.inner.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, title: &str, description: impl Into<String>) {
        self.emit(ChatEvent::Notice {
            level,
            title: title.to_string(),
            description: description.into(),
        });
    }

    // --- state snapshots ---

    pub async fn settings(&self) -> Settings {
        self.inner.chat.lock().await.settings.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.chat.lock().await.phase
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.chat.lock().await.conversations.list().to_vec()
    }

    pub async fn current_conversation(&self) -> Option<Conversation> {
        self.inner.chat.lock().await.conversations.current().cloned()
    }

    pub async fn arena_conversations(&self) -> Vec<Conversation> {
        self.inner.arena.lock().await.conversations.list().to_vec()
    }

    pub async fn current_arena_conversation(&self) -> Option<Conversation> {
        self.inner.arena.lock().await.conversations.current().cloned()
    }

    /// Look a message up in either scope.
    pub async fn find_message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let found = {
            let chat = self.inner.chat.lock().await;
            chat.conversations
                .get(conversation_id)
                .and_then(|c| c.message(message_id).cloned())
        };
        match found {
            Some(message) => Some(message),
            None => {
                let arena = self.inner.arena.lock().await;
                arena
                    .conversations
                    .get(conversation_id)
                    .and_then(|c| c.message(message_id).cloned())
            }
        }
    }

    pub async fn select_arena_conversation(&self, id: &str) -> Result<(), ChatError> {
        let mut arena = self.inner.arena.lock().await;
        arena.conversations.select(id)?;
        Ok(())
    }

    pub async fn arena_loading(&self) -> [bool; 2] {
        self.inner.arena.lock().await.loading
    }

    // --- conversation management ---

    pub async fn new_conversation(&self) -> String {
        let mut chat = self.inner.chat.lock().await;
        let id = chat.conversations.create().id.clone();
        self.persist_chat(&chat);
        id
    }

    pub async fn select_conversation(&self, id: &str) -> Result<(), ChatError> {
        let mut chat = self.inner.chat.lock().await;
        chat.conversations.select(id)?;
        Ok(())
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) -> Result<(), ChatError> {
        let mut chat = self.inner.chat.lock().await;
        chat.conversations.rename(id, title)?;
        self.persist_chat(&chat);
        Ok(())
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        let mut chat = self.inner.chat.lock().await;
        chat.conversations.delete(id)?;
        self.persist_chat(&chat);
        drop(chat);
        self.notice(NoticeLevel::Info, "Conversation deleted", id);
        Ok(())
    }

    pub async fn clear_conversations(&self) {
        let mut chat = self.inner.chat.lock().await;
        chat.conversations.clear();
        self.persist_chat(&chat);
        drop(chat);
        self.notice(NoticeLevel::Info, "Conversations cleared", "All conversations were removed.");
    }

    pub async fn new_arena_conversation(&self) -> String {
        let mut arena = self.inner.arena.lock().await;
        let id = arena.conversations.create().id.clone();
        self.persist_arena(&arena);
        id
    }

    pub async fn delete_arena_conversation(&self, id: &str) -> Result<(), ChatError> {
        let mut arena = self.inner.arena.lock().await;
        arena.conversations.delete(id)?;
        self.persist_arena(&arena);
        Ok(())
    }

    // --- settings ---

    async fn update_settings<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        let mut chat = self.inner.chat.lock().await;
        let result = f(&mut chat.settings);
        if let Err(e) = persist::save_settings(self.inner.storage.as_ref(), &chat.settings) {
            tracing::warn!(error = %e, "failed to persist settings");
        }
        drop(chat);
        self.emit(ChatEvent::SettingsChanged);
        result
    }

    pub async fn set_settings(&self, settings: Settings) {
        self.update_settings(|s| *s = settings).await;
        self.notice(NoticeLevel::Info, "Settings saved", "Your settings have been updated.");
    }

    fn toggle_notice(&self, feature: &str, enabled: bool) {
        let state = if enabled { "enabled" } else { "disabled" };
        self.notice(
            NoticeLevel::Info,
            &format!("{feature} {state}"),
            format!("{feature} is now {state}."),
        );
    }

    pub async fn toggle_web_search(&self) -> bool {
        let enabled = self
            .update_settings(|s| {
                s.web_search_enabled = !s.web_search_enabled;
                s.web_search_enabled
            })
            .await;
        self.toggle_notice("Web search", enabled);
        enabled
    }

    pub async fn toggle_audio_response(&self) -> bool {
        let enabled = self
            .update_settings(|s| {
                s.audio_response_enabled = !s.audio_response_enabled;
                s.audio_response_enabled
            })
            .await;
        self.toggle_notice("Audio response", enabled);
        enabled
    }

    pub async fn toggle_arena_mode(&self) -> bool {
        let enabled = self
            .update_settings(|s| {
                s.arena_mode = !s.arena_mode;
                s.arena_mode
            })
            .await;
        self.toggle_notice("Arena mode", enabled);
        enabled
    }

    pub async fn update_theme(&self, template: Template, dark_mode: bool) -> StyleScope {
        self.update_settings(|s| {
            s.template = template;
            s.dark_mode = dark_mode;
        })
        .await;
        style_scope(template, dark_mode)
    }

    // --- persistence ---

    fn persist_chat(&self, chat: &ChatScope) {
        if let Err(e) = persist::save_conversations(
            self.inner.storage.as_ref(),
            CONVERSATIONS_KEY,
            chat.conversations.list(),
        ) {
            tracing::warn!(error = %e, "failed to persist conversations");
        }
    }

    fn persist_arena(&self, arena: &ArenaScope) {
        if let Err(e) = persist::save_conversations(
            self.inner.storage.as_ref(),
            ARENA_CONVERSATIONS_KEY,
            arena.conversations.list(),
        ) {
            tracing::warn!(error = %e, "failed to persist arena conversations");
        }
    }

    async fn persist(&self, branch: &Branch) {
        match branch {
            Branch::Chat { .. } => self.persist_chat(&*self.inner.chat.lock().await),
            Branch::Arena { .. } => self.persist_arena(&*self.inner.arena.lock().await),
        }
    }

    async fn set_phase(&self, phase: Phase) {
        self.inner.chat.lock().await.phase = phase;
        self.emit(ChatEvent::PhaseChanged(phase));
    }

    /// Apply `f` to a conversation in the branch's scope.
    async fn update<R>(
        &self,
        branch: &Branch,
        conversation_id: &str,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Result<R, ConversationError> {
        match branch {
            Branch::Chat { .. } => {
                let mut chat = self.inner.chat.lock().await;
                Ok(f(chat.conversations.get_mut(conversation_id)?))
            }
            Branch::Arena { .. } => {
                let mut arena = self.inner.arena.lock().await;
                Ok(f(arena.conversations.get_mut(conversation_id)?))
            }
        }
    }

    // --- cancellation ---

    fn begin_request(&self, scope: ScopeKind) -> (u64, CancellationToken) {
        let seq = self.inner.request_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut slots = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots[cancel_slot(scope)] = Some((seq, token.clone()));
        (seq, token)
    }

    fn end_request(&self, scope: ScopeKind, seq: u64) {
        let mut slots = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = &mut slots[cancel_slot(scope)];
        if matches!(slot.as_ref(), Some((current, _)) if *current == seq) {
            *slot = None;
        }
    }

    /// Abort every in-flight request. Text received so far is kept. Returns
    /// `false` when nothing was running.
    pub fn stop_streaming(&self) -> bool {
        let taken: Vec<CancellationToken> = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter_mut()
            .filter_map(|slot| slot.take().map(|(_, token)| token))
            .collect();
        if taken.is_empty() {
            return false;
        }
        tracing::info!(requests = taken.len(), "stopping in-flight response");
        taken.iter().for_each(CancellationToken::cancel);
        true
    }

    // --- sending ---

    pub async fn send(&self, text: &str, options: SendOptions) -> Result<SendOutcome, ChatError> {
        if text.trim().is_empty() {
            self.notice(NoticeLevel::Error, "Empty message", "Type a message before sending.");
            return Err(ChatError::EmptyMessage);
        }
        let settings = self.settings().await;

        if options.return_response {
            return self.request_response(text, &settings).await;
        }
        if settings.arena_mode {
            if options.edited_message_index.is_some() {
                return Err(ChatError::EditInArena);
            }
            return self.send_arena(text, &settings).await;
        }
        self.send_chat(text, options.edited_message_index, &settings)
            .await
    }

    fn chat_target(&self, settings: &Settings) -> Result<Target, ChatError> {
        let target = if settings.web_search_enabled {
            Target {
                provider: ProviderKind::Google,
                model: self.inner.config.chat.search_model.clone(),
                web_search: true,
            }
        } else {
            Target {
                provider: settings.provider,
                model: settings.model.clone(),
                web_search: false,
            }
        };
        if target.model.trim().is_empty() {
            self.notice(NoticeLevel::Error, "Missing model", "Choose a model in settings first.");
            return Err(ChatError::MissingSetting("model"));
        }
        Ok(target)
    }

    fn build_messages(settings: &Settings, history: &[&Message], text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !settings.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::new(Role::System, settings.system_prompt.clone()));
        }
        messages.extend(history.iter().map(|m| m.to_chat_message()));
        messages.push(ChatMessage::new(Role::User, text));
        messages
    }

    /// Voice-input flow: ask for a single reply and hand it back untouched
    /// by conversation state. Errors go to the caller.
    async fn request_response(
        &self,
        text: &str,
        settings: &Settings,
    ) -> Result<SendOutcome, ChatError> {
        let target = self.chat_target(settings)?;
        let messages = {
            let chat = self.inner.chat.lock().await;
            let history = chat
                .conversations
                .current()
                .map(|c| c.history_window(c.messages().len(), settings.history_limit()))
                .unwrap_or_default();
            Self::build_messages(settings, &history, text)
        };

        let request = ChatRequest {
            model: target.model,
            messages,
            temperature: settings.temperature,
            stream: false,
            web_search: target.web_search,
        };
        let provider = self.inner.providers.provider(target.provider)?;
        let content = match provider.send(&request).await? {
            ProviderReply::Complete(completion) => {
                completion.content().unwrap_or_default().to_string()
            }
            ProviderReply::Stream(bytes) => normalize(&sse::collect_text(bytes).await),
        };
        Ok(SendOutcome::Response { content })
    }

    async fn send_chat(
        &self,
        text: &str,
        edited_message_index: Option<usize>,
        settings: &Settings,
    ) -> Result<SendOutcome, ChatError> {
        let target = self.chat_target(settings)?;

        let (conversation_id, user_message_id, messages) = {
            let mut chat = self.inner.chat.lock().await;
            if chat.is_busy() {
                return Err(ChatError::Busy);
            }
            let conversation = chat.conversations.current_or_create();
            let (history_end, user_message_id) = match edited_message_index {
                Some(index) => {
                    conversation.edit_message(index, text)?;
                    (index, conversation.messages()[index].id.clone())
                }
                None => (conversation.messages().len(), String::new()),
            };
            let history = conversation.history_window(history_end, settings.history_limit());
            let messages = Self::build_messages(settings, &history, text);
            let user_message_id = if edited_message_index.is_none() {
                conversation.add_message(Message::user(text))
            } else {
                user_message_id
            };
            let conversation_id = conversation.id.clone();
            chat.phase = Phase::AwaitingResponse;
            self.persist_chat(&chat);
            (conversation_id, user_message_id, messages)
        };
        self.emit(ChatEvent::MessageAdded {
            conversation_id: conversation_id.clone(),
            message_id: user_message_id,
        });
        self.emit(ChatEvent::PhaseChanged(Phase::AwaitingResponse));

        tracing::info!(
            provider = %target.provider,
            model = %target.model,
            history = messages.len() - 1,
            edited = edited_message_index.is_some(),
            "sending chat message"
        );

        let request = ChatRequest {
            model: target.model.clone(),
            messages,
            temperature: settings.temperature,
            stream: settings.stream_enabled,
            web_search: target.web_search,
        };
        let branch = Branch::Chat {
            model: target.model,
        };

        let (seq, token) = self.begin_request(ScopeKind::Chat);
        let reply = self
            .run_request(&branch, &conversation_id, request, target.provider, &token)
            .await;
        self.end_request(ScopeKind::Chat, seq);
        self.set_phase(Phase::Idle).await;

        if let Some(Reply {
            message_id,
            status: ReplyStatus::Completed,
        }) = &reply
        {
            if settings.audio_response_enabled {
                self.spawn_audio(conversation_id.clone(), message_id.clone());
            }
        }

        Ok(SendOutcome::Chat {
            conversation_id,
            reply,
        })
    }

    async fn send_arena(&self, text: &str, settings: &Settings) -> Result<SendOutcome, ChatError> {
        let slots = settings.arena_slots();
        if slots.iter().any(|s| s.model.trim().is_empty()) {
            self.notice(NoticeLevel::Error, "Missing model", "Both arena models must be set.");
            return Err(ChatError::MissingSetting("arena model"));
        }

        let (conversation_id, user_message_id, messages) = {
            let mut arena = self.inner.arena.lock().await;
            if arena.is_busy() {
                return Err(ChatError::Busy);
            }
            let conversation = arena.conversations.current_or_create();
            let history =
                conversation.history_window(conversation.messages().len(), settings.history_limit());
            let messages = Self::build_messages(settings, &history, text);
            let user_message_id = conversation.add_message(Message::user(text));
            let conversation_id = conversation.id.clone();
            arena.loading = [true, true];
            self.persist_arena(&arena);
            (conversation_id, user_message_id, messages)
        };
        self.emit(ChatEvent::MessageAdded {
            conversation_id: conversation_id.clone(),
            message_id: user_message_id,
        });
        for slot in 0..2 {
            self.emit(ChatEvent::ArenaLoading {
                slot,
                loading: true,
            });
        }

        let [slot_a, slot_b] = slots;
        let (seq, token) = self.begin_request(ScopeKind::Arena);
        let (reply_a, reply_b) = futures::join!(
            self.run_arena_branch(0, slot_a, &conversation_id, messages.clone(), settings, &token),
            self.run_arena_branch(1, slot_b, &conversation_id, messages, settings, &token),
        );
        self.end_request(ScopeKind::Arena, seq);

        Ok(SendOutcome::Arena {
            conversation_id,
            replies: [reply_a, reply_b],
        })
    }

    async fn run_arena_branch(
        &self,
        slot: usize,
        config: ArenaSlot,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        settings: &Settings,
        token: &CancellationToken,
    ) -> Option<Reply> {
        tracing::info!(slot = config.label, provider = %config.provider, model = %config.model, "sending arena message");
        let branch = Branch::Arena {
            slot,
            model: config.model.clone(),
            provider: config.provider,
        };
        let request = ChatRequest {
            model: config.model,
            messages,
            temperature: config.temperature,
            stream: settings.stream_enabled,
            web_search: settings.web_search_enabled,
        };
        let reply = self
            .run_request(&branch, conversation_id, request, config.provider, token)
            .await;

        self.inner.arena.lock().await.loading[slot] = false;
        self.emit(ChatEvent::ArenaLoading {
            slot,
            loading: false,
        });
        reply
    }

    /// Dispatch one request and fold its reply into the branch's
    /// conversation. Failures become an assistant error message.
    async fn run_request(
        &self,
        branch: &Branch,
        conversation_id: &str,
        request: ChatRequest,
        provider: ProviderKind,
        token: &CancellationToken,
    ) -> Option<Reply> {
        match self
            .try_request(branch, conversation_id, &request, provider, token)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "chat request failed");
                self.notice(NoticeLevel::Error, "Error", e.to_string());

                let message = branch.label(Message::assistant(branch.error_text()));
                let added = self
                    .update(branch, conversation_id, |c| c.add_message(message))
                    .await;
                self.persist(branch).await;
                match added {
                    Ok(message_id) => {
                        self.emit(ChatEvent::MessageAdded {
                            conversation_id: conversation_id.to_string(),
                            message_id: message_id.clone(),
                        });
                        self.emit(ChatEvent::MessageFinished {
                            conversation_id: conversation_id.to_string(),
                            message_id: message_id.clone(),
                        });
                        Some(Reply {
                            message_id,
                            status: ReplyStatus::Failed(e.to_string()),
                        })
                    }
                    Err(missing) => {
                        tracing::debug!(error = %missing, "conversation gone, dropping error message");
                        None
                    }
                }
            }
        }
    }

    async fn try_request(
        &self,
        branch: &Branch,
        conversation_id: &str,
        request: &ChatRequest,
        provider: ProviderKind,
        token: &CancellationToken,
    ) -> anyhow::Result<Option<Reply>> {
        let provider = self.inner.providers.provider(provider)?;
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!("request cancelled before a reply arrived");
                return Ok(None);
            }
            reply = provider.send(request) => reply?,
        };

        match reply {
            ProviderReply::Stream(bytes) => {
                let reply = self
                    .consume_stream(branch, conversation_id, bytes, token)
                    .await?;
                Ok(Some(reply))
            }
            ProviderReply::Complete(completion) => {
                let content = completion
                    .content()
                    .filter(|c| !c.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| branch.fallback());
                let message = branch.label(Message::assistant(content));
                let message_id = self
                    .update(branch, conversation_id, |c| c.add_message(message))
                    .await?;
                self.persist(branch).await;
                self.emit(ChatEvent::MessageAdded {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.clone(),
                });
                self.emit(ChatEvent::MessageFinished {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.clone(),
                });
                Ok(Some(Reply {
                    message_id,
                    status: ReplyStatus::Completed,
                }))
            }
        }
    }

    /// Fold decoded fragments into a fresh assistant message as they arrive,
    /// then write the normalized text once the stream ends or is cancelled.
    async fn consume_stream(
        &self,
        branch: &Branch,
        conversation_id: &str,
        bytes: ByteStream,
        token: &CancellationToken,
    ) -> anyhow::Result<Reply> {
        let message = branch.label(Message::assistant(""));
        let message_id = self
            .update(branch, conversation_id, |c| c.add_message(message))
            .await?;
        if let Branch::Chat { .. } = branch {
            self.set_phase(Phase::Streaming).await;
        }
        self.persist(branch).await;
        self.emit(ChatEvent::MessageAdded {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
        });

        let mut fragments = sse::decode(bytes);
        let mut cancelled = false;
        loop {
            let fragment = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = fragments.next() => match next {
                    Some(fragment) => fragment,
                    None => break,
                },
            };
            self.update(branch, conversation_id, |c| {
                c.append_stream_chunk(&message_id, &fragment)
            })
            .await??;
            self.emit(ChatEvent::Delta {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.clone(),
                fragment,
            });
        }
        drop(fragments);

        let raw = self
            .update(branch, conversation_id, |c| {
                c.message(&message_id).map(|m| m.content.clone())
            })
            .await?
            .unwrap_or_default();
        let mut text = normalize(&raw);
        if text.is_empty() {
            text = branch.fallback();
        }
        self.update(branch, conversation_id, |c| c.set_content(&message_id, text))
            .await??;
        self.persist(branch).await;
        self.emit(ChatEvent::MessageFinished {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
        });

        if cancelled {
            tracing::info!(chars = raw.len(), "stream stopped, keeping partial reply");
        }
        Ok(Reply {
            message_id,
            status: if cancelled {
                ReplyStatus::Cancelled
            } else {
                ReplyStatus::Completed
            },
        })
    }

    // --- audio ---

    fn spawn_audio(&self, conversation_id: String, message_id: String) {
        if self.inner.voice.is_none() {
            tracing::debug!("audio response enabled but no speech service configured");
            return;
        }
        let session = self.clone();
        let mut tasks = self
            .inner
            .audio_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = session.attach_audio(&conversation_id, &message_id).await {
                tracing::debug!(error = %e, "audio response skipped");
            }
        });
    }

    /// Wait for audio synthesis started by earlier replies to finish.
    pub async fn wait_for_audio(&self) {
        let mut tasks = std::mem::take(
            &mut *self
                .inner
                .audio_tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        while tasks.join_next().await.is_some() {}
    }

    /// Synthesize a reply, store the clip and attach its URL to the message.
    pub async fn attach_audio(&self, conversation_id: &str, message_id: &str) -> anyhow::Result<String> {
        let voice = self
            .inner
            .voice
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no speech service configured"))?;
        let branch = Branch::Chat {
            model: String::new(),
        };
        let content = self
            .update(&branch, conversation_id, |c| {
                c.message(message_id).map(|m| m.content.clone())
            })
            .await?
            .ok_or_else(|| ConversationError::MessageNotFound(message_id.to_string()))?;

        let audio = voice.speech.text_to_speech(&speech_text(&content)).await?;
        let url = voice.store.store(message_id, &audio).await?;

        self.update(&branch, conversation_id, |c| c.attach_audio(message_id, url.clone()))
            .await??;
        self.persist(&branch).await;
        self.emit(ChatEvent::AudioReady {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            url: url.clone(),
        });
        Ok(url)
    }
}

fn cancel_slot(scope: ScopeKind) -> usize {
    match scope {
        ScopeKind::Chat => 0,
        ScopeKind::Arena => 1,
    }
}
