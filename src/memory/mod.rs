//! 记忆层：Agent 对话历史（有界环形缓冲）与带 TTL 的对话缓存

pub mod cache;
pub mod conversation;

pub use cache::{
    conversation_key, ConversationCache, InMemoryConversationCache, SqliteConversationCache,
    DEFAULT_CONVERSATION_TTL,
};
pub use conversation::{ConversationStore, ConversationSummary, Message, Role};
