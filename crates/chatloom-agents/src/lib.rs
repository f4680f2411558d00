pub mod accumulator;
pub mod attachments;
pub mod catalog;
pub mod context;
pub mod conversations;
pub mod events;
pub mod invoker;
pub mod locks;
pub mod mcp;
pub mod providers;
pub mod runtime;
pub mod tools;

pub use accumulator::{ToolCallAccumulator, ToolCallAssembler};
pub use attachments::{AttachmentStorage, UploadedFile, classify_extension};
pub use catalog::{McpToolRef, ToolCatalog, ToolSelection};
pub use context::RequestContext;
pub use conversations::{ConversationService, DeletedConversation};
pub use events::{ChatEvent, EventKind, EventSink};
pub use invoker::ToolInvoker;
pub use locks::ConversationLocks;
pub use mcp::McpPool;
pub use providers::{
    ChatMessage, ChatRole, FinishReason, LlmProvider, LlmRequest, LlmResponse, LlmStream,
    ProviderKind, ProviderRegistry, StreamChunk, ToolCall, ToolCallDelta, ToolDefinition, Usage,
    validate_stored_providers,
};
pub use runtime::{ConversationRuntime, EventStream, RuntimeSettings, SendMessageRequest, derive_title};
pub use tools::{InternalToolRegistry, Tool, ToolContext, ToolOutput};
