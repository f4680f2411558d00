use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AnswerDelta,
    Answer,
    ToolCall,
    ToolCallProcessing,
    ToolCallEnd,
    Error,
}

/// One frame of a turn's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub conversation_id: String,
    pub request_id: String,
    pub message_type: EventKind,
    pub content: String,
}

impl ChatEvent {
    pub fn to_json(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `data: <json>\n\n`
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Producer half of a turn's event pipe, bound to one conversation and request.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
    conversation_id: String,
    request_id: String,
}

impl EventSink {
    pub fn new(
        tx: mpsc::Sender<ChatEvent>,
        conversation_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns false once the consumer has gone away.
    pub async fn emit(&self, kind: EventKind, content: impl Into<String>) -> bool {
        let event = ChatEvent {
            conversation_id: self.conversation_id.clone(),
            request_id: self.request_id.clone(),
            message_type: kind,
            content: content.into(),
        };
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
