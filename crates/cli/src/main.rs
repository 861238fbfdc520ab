use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colloquy_config::{Config, ProviderKind, Template};
use colloquy_core::persist::FileStorage;
use colloquy_core::session::{NoticeLevel, ReplyStatus, Voice};
use colloquy_core::voice::{self, AudioStore, OpenAiSpeech, Speech};
use colloquy_core::{ChatEvent, ChatSession, SendOptions, SendOutcome};
use colloquy_provider::ConfiguredProviders;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "colloquy", about = "Chat with LLM providers from the terminal", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to the current conversation
    Send {
        message: String,
        /// Rewrite the user message at this index and regenerate from there
        #[arg(long)]
        edit: Option<usize>,
    },
    /// Interactive chat (the default)
    Chat,
    /// List conversations
    List {
        #[arg(long)]
        arena: bool,
    },
    /// Print a conversation (the current one by default)
    Show {
        id: Option<String>,
        #[arg(long)]
        arena: bool,
    },
    /// Start a new conversation
    New {
        #[arg(long)]
        arena: bool,
    },
    Rename {
        id: String,
        title: String,
    },
    Delete {
        id: String,
        #[arg(long)]
        arena: bool,
    },
    /// Remove every single-chat conversation
    Clear,
    /// Choose provider and model (saved for later runs)
    Use {
        provider: ProviderKind,
        model: String,
        /// Configure an arena slot instead of the single-chat model
        #[arg(long)]
        slot: Option<ArenaSide>,
    },
    /// Flip a feature on or off
    Toggle { feature: Feature },
    /// Pick the presentation template
    Theme {
        template: String,
        #[arg(long)]
        dark: bool,
    },
    /// Transcribe an audio file, optionally asking the model about it
    Transcribe {
        file: PathBuf,
        /// Send the transcript and print the reply without saving it
        #[arg(long)]
        reply: bool,
        /// Write a spoken version of the reply to this file
        #[arg(long, requires = "reply")]
        speak: Option<PathBuf>,
    },
    /// Show current configuration and settings
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArenaSide {
    A,
    B,
}

#[derive(Clone, Copy, ValueEnum)]
enum Feature {
    WebSearch,
    Audio,
    Arena,
    Stream,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("colloquy=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let global = Config::load()?;
    let config = match Config::load_project(&std::env::current_dir()?)? {
        Some(project) => Config::merge(&global, &project),
        None => global,
    };
    config.ensure_dirs()?;

    let data_dir = config.data_dir();
    let spoken_replies = Voice {
        speech: Arc::new(OpenAiSpeech::from_config(&config)),
        store: AudioStore::new(&data_dir),
    };
    let session = ChatSession::new(
        config.clone(),
        Arc::new(ConfiguredProviders::new(config.clone())),
        Arc::new(FileStorage::new(&data_dir)),
        Some(spoken_replies),
    );

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Send { message, edit } => {
            spawn_interrupt_handler(session.clone(), false);
            let options = SendOptions {
                edited_message_index: edit,
                return_response: false,
            };
            send_and_render(&session, &message, options).await?;
            session.wait_for_audio().await;
        }
        Commands::Chat => {
            spawn_interrupt_handler(session.clone(), true);
            interactive(&session).await?;
            session.wait_for_audio().await;
        }
        Commands::List { arena } => {
            let (conversations, current) = if arena {
                let current = session.current_arena_conversation().await.map(|c| c.id);
                (session.arena_conversations().await, current)
            } else {
                let current = session.current_conversation().await.map(|c| c.id);
                (session.conversations().await, current)
            };
            for c in conversations {
                let marker = if current.as_deref() == Some(c.id.as_str()) { "*" } else { " " };
                println!(
                    "{marker} {}  {}  ({} messages, updated {})",
                    c.id,
                    c.title,
                    c.messages().len(),
                    c.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Show { id, arena } => {
            let conversations = if arena {
                session.arena_conversations().await
            } else {
                session.conversations().await
            };
            let current = if arena {
                session.current_arena_conversation().await
            } else {
                session.current_conversation().await
            };
            let conversation = match id {
                Some(id) => conversations.into_iter().find(|c| c.id == id),
                None => current,
            };
            let Some(conversation) = conversation else {
                anyhow::bail!("conversation not found");
            };
            println!("# {}\n", conversation.title);
            for (i, m) in conversation.messages().iter().enumerate() {
                let who = m.model.as_deref().unwrap_or(m.role.as_str());
                println!("[{i}] {who}:\n{}\n", m.content);
            }
        }
        Commands::New { arena } => {
            let id = if arena {
                session.new_arena_conversation().await
            } else {
                session.new_conversation().await
            };
            println!("{id}");
        }
        Commands::Rename { id, title } => session.rename_conversation(&id, &title).await?,
        Commands::Delete { id, arena } => {
            if arena {
                session.delete_arena_conversation(&id).await?;
            } else {
                session.delete_conversation(&id).await?;
            }
        }
        Commands::Clear => session.clear_conversations().await,
        Commands::Use {
            provider,
            model,
            slot,
        } => {
            let mut settings = session.settings().await;
            match slot {
                None => {
                    settings.provider = provider;
                    settings.model = model;
                }
                Some(ArenaSide::A) => {
                    settings.provider_a = provider;
                    settings.model_a = model;
                }
                Some(ArenaSide::B) => {
                    settings.provider_b = provider;
                    settings.model_b = model;
                }
            }
            session.set_settings(settings).await;
        }
        Commands::Toggle { feature } => {
            let (name, enabled) = toggle(&session, feature).await;
            println!("{name}: {}", if enabled { "on" } else { "off" });
        }
        Commands::Theme { template, dark } => {
            let scope = session
                .update_theme(Template::from_name(&template), dark)
                .await;
            println!("{}", scope.class_list());
        }
        Commands::Transcribe {
            file,
            reply,
            speak,
        } => {
            let speech = OpenAiSpeech::from_config(&config);
            let transcript = voice::transcribe_file(&speech, &file).await?;
            println!("{transcript}");
            if reply {
                let options = SendOptions {
                    edited_message_index: None,
                    return_response: true,
                };
                if let SendOutcome::Response { content } = session.send(&transcript, options).await? {
                    println!("\n{content}");
                    if let Some(out) = speak {
                        let audio = speech.text_to_speech(&voice::speech_text(&content)).await?;
                        std::fs::write(&out, audio)?;
                        println!("Saved audio to {}", out.display());
                    }
                }
            }
        }
        Commands::Config => {
            println!("Config path: {}", Config::config_path().display());
            println!("Data dir: {}", data_dir.display());
            println!("{}", toml::to_string_pretty(&config)?);
            println!("{}", serde_json::to_string_pretty(&session.settings().await)?);
        }
    }

    Ok(())
}

async fn toggle(session: &ChatSession, feature: Feature) -> (&'static str, bool) {
    match feature {
        Feature::WebSearch => ("web search", session.toggle_web_search().await),
        Feature::Audio => ("audio response", session.toggle_audio_response().await),
        Feature::Arena => ("arena mode", session.toggle_arena_mode().await),
        Feature::Stream => {
            let mut settings = session.settings().await;
            settings.stream_enabled = !settings.stream_enabled;
            let enabled = settings.stream_enabled;
            session.set_settings(settings).await;
            ("streaming", enabled)
        }
    }
}

/// Ctrl-C stops the in-flight reply. With nothing in flight it exits, unless
/// `keep_running` says the caller owns the idle case.
fn spawn_interrupt_handler(session: ChatSession, keep_running: bool) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if session.stop_streaming() {
                continue;
            }
            if !keep_running {
                std::process::exit(130);
            }
            eprintln!("\n(type /quit to leave)");
        }
    });
}

async fn interactive(session: &ChatSession) -> Result<()> {
    let settings = session.settings().await;
    println!(
        "colloquy {} | {} / {}{}",
        env!("CARGO_PKG_VERSION"),
        settings.provider,
        settings.model,
        if settings.arena_mode { " | arena" } else { "" }
    );
    println!("Commands: /new /list /select <id> /web /audio /arena /quit\n");
    if let Some(last) = session.current_conversation().await.and_then(|c| c.last_message().cloned()) {
        println!("{}\n", last.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                let id = if session.settings().await.arena_mode {
                    session.new_arena_conversation().await
                } else {
                    session.new_conversation().await
                };
                println!("Started {id}");
            }
            "/list" => {
                for c in session.conversations().await {
                    println!("  {}  {}", c.id, c.title);
                }
            }
            _ if line.starts_with("/select ") => {
                let id = line.trim_start_matches("/select ").trim();
                let selected = if session.settings().await.arena_mode {
                    session.select_arena_conversation(id).await
                } else {
                    session.select_conversation(id).await
                };
                match selected {
                    Ok(()) => println!("Switched to {id}"),
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            "/web" | "/audio" | "/arena" => {
                let feature = match line {
                    "/web" => Feature::WebSearch,
                    "/audio" => Feature::Audio,
                    _ => Feature::Arena,
                };
                let (name, enabled) = toggle(session, feature).await;
                println!("{name}: {}", if enabled { "on" } else { "off" });
            }
            text => {
                if let Err(e) = send_and_render(session, text, SendOptions::default()).await {
                    eprintln!("Error: {e}");
                }
            }
        }
    }
    Ok(())
}

/// Send a message and render events while the request runs. Single-chat
/// replies print as they stream; arena replies print whole, labelled by slot.
async fn send_and_render(
    session: &ChatSession,
    text: &str,
    options: SendOptions,
) -> Result<()> {
    let mut events = session.subscribe();
    let mut renderer = Renderer::default();

    let send = session.send(text, options);
    tokio::pin!(send);
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            event = events.recv() => match event {
                Ok(event) => renderer.render(session, event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "renderer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        renderer.render(session, event).await;
    }

    match outcome? {
        SendOutcome::Chat {
            reply: Some(reply), ..
        } => {
            if reply.status == ReplyStatus::Cancelled {
                println!("\n[stopped]");
            }
        }
        SendOutcome::Chat { reply: None, .. } => println!("[stopped before a reply arrived]"),
        SendOutcome::Response { content } => println!("{content}"),
        SendOutcome::Arena { .. } => {}
    }
    Ok(())
}

#[derive(Default)]
struct Renderer {
    streamed: HashSet<String>,
}

impl Renderer {
    async fn render(&mut self, session: &ChatSession, event: ChatEvent) {
        match event {
            ChatEvent::Delta {
                conversation_id,
                message_id,
                fragment,
            } if !conversation_id.starts_with("arena-") => {
                self.streamed.insert(message_id);
                print!("{fragment}");
                let _ = std::io::stdout().flush();
            }
            ChatEvent::MessageFinished {
                conversation_id,
                message_id,
            } => {
                let Some(message) = session.find_message(&conversation_id, &message_id).await
                else {
                    return;
                };
                if self.streamed.remove(&message_id) {
                    println!("\n");
                } else if conversation_id.starts_with("arena-") {
                    let slot = if message.model_a.is_some() { "A" } else { "B" };
                    let model = message.model.as_deref().unwrap_or("unknown");
                    println!("--- Model {slot} ({model}) ---\n{}\n", message.content);
                } else {
                    println!("{}\n", message.content);
                }
            }
            ChatEvent::Notice {
                level: NoticeLevel::Error,
                title,
                description,
            } => eprintln!("{title}: {description}"),
            ChatEvent::AudioReady { url, .. } => eprintln!("(audio: {url})"),
            _ => {}
        }
    }
}
