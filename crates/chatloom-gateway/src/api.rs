use std::convert::Infallible;

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chatloom_agents::{McpToolRef, SendMessageRequest, ToolSelection, UploadedFile};
use chatloom_common::Error;
use chatloom_db::{Attachment, Conversation, PageRequest, StoredMessage};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::auth::Authenticated;
use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub service_user_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mcp_tools: Vec<McpToolRef>,
    #[serde(default)]
    pub internal_tools: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub streamable: Option<bool>,
    #[serde(default)]
    pub predefined_answer: Option<String>,
}

impl From<SendMessageBody> for SendMessageRequest {
    fn from(body: SendMessageBody) -> Self {
        SendMessageRequest {
            service_user_id: body.service_user_id,
            system_prompt: body.system_prompt,
            message: body.message,
            conversation_id: body.conversation_id,
            tools: ToolSelection {
                internal_tools: body.internal_tools,
                mcp_tools: body.mcp_tools,
            },
            attachments: body.attachments,
            streamable: body.streamable,
            predefined_answer: body.predefined_answer,
        }
    }
}

/// POST /api/v1/chat/messages: run one turn and stream its events.
pub async fn send_message(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.runtime.send_message(ctx, body.into()).await?;
    let stream = events.map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/v1/attachments: multipart upload in the `file` field.
pub async fn upload_attachment(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    mut multipart: Multipart,
) -> Result<Json<Attachment>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(format!("failed to read upload: {e}")))?;
        let attachment = state
            .conversations
            .upload(
                &ctx,
                UploadedFile {
                    file_name,
                    bytes: bytes.to_vec(),
                },
            )
            .await?;
        return Ok(Json(attachment));
    }
    Err(Error::Validation("multipart field 'file' is required".into()).into())
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub service_user_id: String,
    pub last_id: Option<String>,
    pub size: Option<usize>,
}

/// GET /api/v1/conversations
pub async fn list_conversations(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let page = PageRequest {
        last_id: query.last_id,
        size: query.size,
    };
    let conversations = state
        .conversations
        .list_conversations(&ctx, &query.service_user_id, &page)
        .await?;
    Ok(Json(conversations))
}

/// GET /api/v1/conversations/{id}/messages
pub async fn list_messages(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let messages = state.conversations.list_messages(&ctx, &id, &page).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub service_user_id: String,
    pub title: String,
}

/// PATCH /api/v1/conversations/{id}
pub async fn rename_conversation(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .conversations
        .rename(&ctx, &body.service_user_id, &id, &body.title)
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub service_user_id: String,
}

/// DELETE /api/v1/conversations/{id}
pub async fn delete_conversation(
    State(state): State<SharedState>,
    Authenticated(ctx): Authenticated,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<Value>, ApiError> {
    let removed = state
        .conversations
        .delete(&ctx, &owner.service_user_id, &id)
        .await?;
    info!(conversation_id = %id, "conversation deleted via API");
    Ok(Json(json!({
        "conversation_id": id,
        "deleted_messages": removed.messages,
        "deleted_attachments": removed.attachments,
    })))
}
