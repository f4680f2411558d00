use std::sync::Arc;

use async_trait::async_trait;
use chatloom_common::{Error, Result};
use chatloom_db::AttachmentStore;
use serde_json::json;

use crate::tools::{Tool, ToolContext, ToolOutput};

/// Returns the extracted text of an attachment bound to the current
/// conversation.
pub struct ReadAttachment {
    store: Arc<dyn AttachmentStore>,
}

impl ReadAttachment {
    pub fn new(store: Arc<dyn AttachmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ReadAttachment {
    fn name(&self) -> &'static str {
        "read_attachment"
    }

    fn description(&self) -> &'static str {
        "Read the text content of a file the user attached to this conversation. \
         Attachment ids are listed in the attachment manifest of the user message."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "attachment_id": {
                    "type": "string",
                    "description": "Id of the attachment to read"
                }
            },
            "required": ["attachment_id"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let id = args["attachment_id"]
            .as_str()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Tool("missing or invalid 'attachment_id' argument".into()))?;

        let attachment = self
            .store
            .get_attachment(id)
            .await?
            .filter(|a| a.conversation_id.as_deref() == Some(context.conversation_id.as_str()))
            .ok_or_else(|| Error::Tool(format!("attachment '{id}' not found in this conversation")))?;

        match attachment.content {
            Some(text) => Ok(ToolOutput::success(text)),
            None => Ok(ToolOutput::error(format!(
                "attachment '{}' ({}) has no readable text",
                attachment.file_name, attachment.mime_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_db::{AttachmentKind, NewAttachment, SqliteStore};

    async fn store_with_note() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .create_attachment(NewAttachment {
                id: "att-1".into(),
                agent_id: "agent".into(),
                application_id: "default".into(),
                file_name: "notes.md".into(),
                extension: ".md".into(),
                size_bytes: 5,
                mime_type: "text/markdown".into(),
                storage_path: "/tmp/none".into(),
                kind: AttachmentKind::Document,
                processed: true,
                processing_error: None,
                content: Some("# hi".into()),
            })
            .await
            .unwrap();
        store
            .bind_attachment("att-1", "msg-1", "conv-1")
            .await
            .unwrap();
        store
    }

    fn ctx(conversation_id: &str) -> ToolContext {
        ToolContext {
            conversation_id: conversation_id.into(),
            request_id: "r".into(),
            agent_id: "agent".into(),
            application_id: "default".into(),
        }
    }

    #[tokio::test]
    async fn reads_bound_attachment_text() {
        let tool = ReadAttachment::new(store_with_note().await);
        let out = tool
            .execute(&ctx("conv-1"), json!({"attachment_id": "att-1"}))
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::success("# hi"));
    }

    #[tokio::test]
    async fn other_conversation_cannot_read_it() {
        let tool = ReadAttachment::new(store_with_note().await);
        let err = tool
            .execute(&ctx("conv-2"), json!({"attachment_id": "att-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }
}
