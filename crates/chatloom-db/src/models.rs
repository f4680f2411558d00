use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chatloom_common::Error;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// A persistent chat thread owned by one agent and one external user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub application_id: String,
    pub service_user_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub agent_id: String,
    pub application_id: String,
    pub service_user_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl FromStr for MessageRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(Error::Database(format!("unknown message role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    FunctionCall,
    FunctionCallOutput,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::FunctionCall => "function_call",
            MessageKind::FunctionCallOutput => "function_call_output",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Type-dependent payload of a message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Message {
        role: MessageRole,
        content: String,
        /// JSON manifest `[{"id", "name"}]` of bound attachments.
        #[serde(skip_serializing_if = "Option::is_none")]
        attachments: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        name: String,
        output: String,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Message { .. } => MessageKind::Message,
            MessageBody::FunctionCall { .. } => MessageKind::FunctionCall,
            MessageBody::FunctionCallOutput { .. } => MessageKind::FunctionCallOutput,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub agent_id: String,
    pub application_id: String,
    pub request_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub application_id: String,
    pub request_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
    pub created_at: String,
}

impl StoredMessage {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
    Other,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
            AttachmentKind::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "image" => AttachmentKind::Image,
            "document" => AttachmentKind::Document,
            _ => AttachmentKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub agent_id: String,
    pub application_id: String,
    pub file_name: String,
    pub extension: String,
    pub size_bytes: u64,
    pub mime_type: String,
    #[serde(skip_serializing)]
    pub storage_path: String,
    pub kind: AttachmentKind,
    pub processed: bool,
    pub processing_error: Option<String>,
    #[serde(skip_serializing)]
    pub content: Option<String>,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub id: String,
    pub agent_id: String,
    pub application_id: String,
    pub file_name: String,
    pub extension: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub storage_path: String,
    pub kind: AttachmentKind,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub content: Option<String>,
}

/// Immutable per-call snapshot of an agent's chat configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub application_id: String,
    pub system_prompt: String,
    pub chat_model_id: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// History limit in messages, when enabled.
    pub context_length_limit: Option<u32>,
    /// Output token limit, when enabled.
    pub max_output_tokens: Option<u32>,
    pub default_streamable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatModel {
    pub id: String,
    pub name: String,
    pub provider_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub id: String,
    pub name: String,
    /// Provider type tag, resolved by the agents provider registry.
    pub kind: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    /// Short external id used in composite tool names.
    pub config_id: String,
    pub name: String,
    pub transport: String,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct McpServerTool {
    pub id: String,
    pub server_id: String,
    pub name: String,
}

/// Cursor page: rows strictly older than `last_id`, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    pub last_id: Option<String>,
    pub size: Option<usize>,
}

impl PageRequest {
    pub fn new(last_id: Option<String>, size: usize) -> Self {
        Self {
            last_id,
            size: Some(size),
        }
    }

    /// Requested size, or the default when absent or outside 1..=100.
    pub fn limit(&self) -> usize {
        match self.size {
            Some(size) if (1..=MAX_PAGE_SIZE).contains(&size) => size,
            _ => DEFAULT_PAGE_SIZE,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.last_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}
