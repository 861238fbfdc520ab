pub mod conversation;
pub mod normalize;
pub mod persist;
pub mod session;
pub mod state;
pub mod theme;
pub mod tokens;
pub mod voice;

pub use conversation::{Conversation, ConversationError, Message};
pub use session::{ChatError, ChatEvent, ChatSession, SendOptions, SendOutcome};
