pub mod migrations;
pub mod models;
pub mod seed;
pub mod sqlite;
pub mod store;

pub use models::{
    AgentProfile, Attachment, AttachmentKind, ChatModel, Conversation, LlmProviderConfig,
    McpServerConfig, McpServerTool, MessageBody, MessageKind, MessageRole, NewAttachment,
    NewConversation, NewMessage, PageRequest, StoredMessage, TokenUsage,
};
pub use seed::{SeedReport, apply_seed};
pub use sqlite::SqliteStore;
pub use store::{AgentDirectory, AttachmentStore, MessageStore};
