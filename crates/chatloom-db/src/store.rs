use async_trait::async_trait;
use chatloom_common::Result;

use crate::models::{
    AgentProfile, Attachment, ChatModel, Conversation, LlmProviderConfig, McpServerConfig,
    McpServerTool, NewAttachment, NewConversation, NewMessage, PageRequest, StoredMessage,
};

/// Durable append-only log of conversation turns.
///
/// Reads never return soft-deleted rows.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Conversations of one (agent, service user) pair, newest first.
    async fn list_conversations(
        &self,
        agent_id: &str,
        service_user_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Conversation>>;

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<()>;

    /// Soft-delete the conversation and all of its messages. Returns the
    /// number of messages marked deleted.
    async fn delete_conversation(&self, id: &str) -> Result<usize>;

    async fn append_message(&self, new: NewMessage) -> Result<StoredMessage>;

    /// Messages of a conversation, newest first.
    async fn list_messages(
        &self,
        conversation_id: &str,
        agent_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<StoredMessage>>;

    /// The most recent `limit` role-bearing `message` rows, oldest first.
    async fn recent_history(
        &self,
        conversation_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;

    /// Every row of one turn in creation order.
    async fn messages_for_request(&self, request_id: &str) -> Result<Vec<StoredMessage>>;
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn create_attachment(&self, new: NewAttachment) -> Result<Attachment>;

    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>>;

    async fn bind_attachment(&self, id: &str, message_id: &str, conversation_id: &str)
    -> Result<()>;

    async fn attachments_for_conversation(&self, conversation_id: &str)
    -> Result<Vec<Attachment>>;

    async fn delete_attachment(&self, id: &str) -> Result<()>;
}

/// Read-only view of agents, models, providers and MCP servers.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent(&self, id: &str) -> Result<Option<AgentProfile>>;

    /// Resolve the agent owning a plaintext API key.
    async fn authenticate(&self, api_key: &str) -> Result<Option<AgentProfile>>;

    async fn chat_model(&self, id: &str) -> Result<Option<ChatModel>>;

    async fn llm_provider(&self, id: &str) -> Result<Option<LlmProviderConfig>>;

    async fn llm_providers(&self) -> Result<Vec<LlmProviderConfig>>;

    /// MCP tools the agent has saved as enabled.
    async fn enabled_mcp_tools(&self, agent_id: &str) -> Result<Vec<McpServerTool>>;

    async fn mcp_server(&self, id: &str) -> Result<Option<McpServerConfig>>;

    async fn mcp_server_by_config_id(&self, config_id: &str) -> Result<Option<McpServerConfig>>;
}
