use std::sync::Arc;

use chatloom_common::{Error, Result, parse_id};
use chatloom_db::{
    Attachment, AttachmentStore, Conversation, MessageStore, PageRequest, StoredMessage,
};
use tracing::{info, instrument, warn};

use crate::attachments::{AttachmentStorage, UploadedFile};
use crate::context::RequestContext;
use crate::locks::ConversationLocks;

const MAX_TITLE_CHARS: usize = 255;

/// What a conversation delete removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedConversation {
    pub messages: usize,
    pub attachments: usize,
}

/// Conversation housekeeping around the turn runtime: paging, renaming,
/// deleting and attachment uploads.
pub struct ConversationService {
    messages: Arc<dyn MessageStore>,
    attachments: Arc<dyn AttachmentStore>,
    storage: AttachmentStorage,
    locks: ConversationLocks,
}

impl ConversationService {
    /// `locks` must be the runtime's, so a delete waits for an in-flight turn.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        attachments: Arc<dyn AttachmentStore>,
        storage: AttachmentStorage,
        locks: ConversationLocks,
    ) -> Self {
        Self {
            messages,
            attachments,
            storage,
            locks,
        }
    }

    pub fn storage(&self) -> &AttachmentStorage {
        &self.storage
    }

    pub async fn list_conversations(
        &self,
        ctx: &RequestContext,
        service_user_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Conversation>> {
        let service_user_id = required_user(service_user_id)?;
        self.messages
            .list_conversations(ctx.agent_id(), service_user_id, page)
            .await
    }

    /// Messages of one of the agent's conversations, newest first.
    pub async fn list_messages(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<StoredMessage>> {
        let id = parse_id(conversation_id, "conversation")?;
        match self.messages.get_conversation(&id).await? {
            Some(conv) if conv.agent_id == ctx.agent_id() => {
                self.messages.list_messages(&id, ctx.agent_id(), page).await
            }
            _ => Err(Error::NotFound(format!("conversation {id}"))),
        }
    }

    #[instrument(skip(self, ctx, title), fields(agent_id = %ctx.agent_id()))]
    pub async fn rename(
        &self,
        ctx: &RequestContext,
        service_user_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("title must not be empty".into()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(Error::Validation(format!(
                "title is longer than {MAX_TITLE_CHARS} characters"
            )));
        }
        let mut conv = self
            .owned_conversation(ctx, service_user_id, conversation_id)
            .await?;
        self.messages.rename_conversation(&conv.id, title).await?;
        conv.title = title.to_string();
        info!(conversation_id = %conv.id, "renamed conversation");
        Ok(conv)
    }

    /// Soft-delete a conversation and its messages, removing its attachment
    /// files and records first. Waits for any turn running on it.
    #[instrument(skip(self, ctx), fields(agent_id = %ctx.agent_id()))]
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        service_user_id: &str,
        conversation_id: &str,
    ) -> Result<DeletedConversation> {
        let conv = self
            .owned_conversation(ctx, service_user_id, conversation_id)
            .await?;
        let removed = self
            .locks
            .run_locked(&conv.id, self.remove_conversation(&conv.id))
            .await?;
        info!(
            conversation_id = %conv.id,
            messages = removed.messages,
            attachments = removed.attachments,
            "deleted conversation"
        );
        Ok(removed)
    }

    async fn remove_conversation(&self, conversation_id: &str) -> Result<DeletedConversation> {
        let attachments = self
            .attachments
            .attachments_for_conversation(conversation_id)
            .await?;
        for attachment in &attachments {
            if let Err(e) = self.storage.remove(&attachment.id).await {
                warn!(attachment_id = %attachment.id, "failed to remove attachment file: {e}");
            }
            self.attachments.delete_attachment(&attachment.id).await?;
        }
        let messages = self.messages.delete_conversation(conversation_id).await?;
        Ok(DeletedConversation {
            messages,
            attachments: attachments.len(),
        })
    }

    /// Store an upload and record it, unbound to any message yet.
    #[instrument(skip(self, ctx, file), fields(agent_id = %ctx.agent_id(), file = %file.file_name))]
    pub async fn upload(&self, ctx: &RequestContext, file: UploadedFile) -> Result<Attachment> {
        let new = self.storage.save(ctx, file).await?;
        let id = new.id.clone();
        match self.attachments.create_attachment(new).await {
            Ok(attachment) => {
                info!(attachment_id = %attachment.id, size = attachment.size_bytes, "attachment uploaded");
                Ok(attachment)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage.remove(&id).await {
                    warn!(attachment_id = %id, "failed to clean up attachment file: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn owned_conversation(
        &self,
        ctx: &RequestContext,
        service_user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        let service_user_id = required_user(service_user_id)?;
        let id = parse_id(conversation_id, "conversation")?;
        let conv = self
            .messages
            .get_conversation(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
        if conv.agent_id != ctx.agent_id() || conv.service_user_id != service_user_id {
            return Err(Error::Forbidden(
                "conversation belongs to another user".into(),
            ));
        }
        Ok(conv)
    }
}

fn required_user(service_user_id: &str) -> Result<&str> {
    let trimmed = service_user_id.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("service_user_id is required".into()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_db::{
        AgentProfile, MessageBody, MessageRole, NewConversation, NewMessage, SqliteStore,
    };

    fn agent(id: &str) -> AgentProfile {
        AgentProfile {
            id: id.into(),
            name: "helper".into(),
            application_id: "default".into(),
            system_prompt: String::new(),
            chat_model_id: None,
            temperature: None,
            top_p: None,
            context_length_limit: None,
            max_output_tokens: None,
            default_streamable: true,
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        service: ConversationService,
        ctx: RequestContext,
        conv: Conversation,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let service = ConversationService::new(
            store.clone(),
            store.clone(),
            AttachmentStorage::new(dir.path(), 1024),
            ConversationLocks::new(),
        );
        let conv = store
            .create_conversation(NewConversation {
                agent_id: "agent-1".into(),
                application_id: "default".into(),
                service_user_id: "alice".into(),
                title: "hello".into(),
            })
            .await
            .unwrap();
        store
            .append_message(NewMessage {
                conversation_id: conv.id.clone(),
                agent_id: "agent-1".into(),
                application_id: "default".into(),
                request_id: "req-1".into(),
                body: MessageBody::Message {
                    role: MessageRole::User,
                    content: "hello".into(),
                    attachments: None,
                    usage: None,
                },
            })
            .await
            .unwrap();
        Fixture {
            store,
            service,
            ctx: RequestContext::new(agent("agent-1")),
            conv,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn rename_and_delete_check_ownership() {
        let f = fixture().await;

        let err = f
            .service
            .rename(&f.ctx, "mallory", &f.conv.id, "mine now")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = f.service.delete(&f.ctx, "mallory", &f.conv.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let other_agent = RequestContext::new(agent("agent-2"));
        let err = f
            .service
            .delete(&other_agent, "alice", &f.conv.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let conv = f.store.get_conversation(&f.conv.id).await.unwrap().unwrap();
        assert_eq!(conv.title, "hello");
        let messages = f
            .service
            .list_messages(&f.ctx, &f.conv.id, &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn rename_updates_title() {
        let f = fixture().await;
        let conv = f
            .service
            .rename(&f.ctx, "alice", &f.conv.id, "  Trip plans ")
            .await
            .unwrap();
        assert_eq!(conv.title, "Trip plans");
        let stored = f.store.get_conversation(&f.conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Trip plans");

        let err = f
            .service
            .rename(&f.ctx, "alice", "not-an-id", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_attachments_and_hides_messages() {
        let f = fixture().await;
        let attachment = f
            .service
            .upload(
                &f.ctx,
                UploadedFile {
                    file_name: "notes.md".into(),
                    bytes: b"# notes".to_vec(),
                },
            )
            .await
            .unwrap();
        f.store
            .bind_attachment(&attachment.id, "msg-1", &f.conv.id)
            .await
            .unwrap();
        let path = std::path::PathBuf::from(&attachment.storage_path);
        assert!(path.exists());

        let removed = f.service.delete(&f.ctx, "alice", &f.conv.id).await.unwrap();
        assert_eq!(
            removed,
            DeletedConversation {
                messages: 1,
                attachments: 1
            }
        );
        assert!(!path.exists());
        assert!(f.store.get_attachment(&attachment.id).await.unwrap().is_none());
        assert!(f.store.get_conversation(&f.conv.id).await.unwrap().is_none());

        let err = f
            .service
            .list_messages(&f.ctx, &f.conv.id, &PageRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_waits_for_the_running_turn() {
        let f = fixture().await;
        let locks = f.service.locks.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();
        let conv_id = f.conv.id.clone();
        let turn = tokio::spawn(async move {
            locks
                .run_locked(&conv_id, async move {
                    let _ = held_tx.send(());
                    let _ = release_rx.await;
                })
                .await;
        });
        held_rx.await.unwrap();

        let delete = f.service.delete(&f.ctx, "alice", &f.conv.id);
        tokio::pin!(delete);
        let early = tokio::time::timeout(std::time::Duration::from_millis(50), &mut delete).await;
        assert!(early.is_err(), "delete finished while the turn held the lock");
        assert!(f.store.get_conversation(&f.conv.id).await.unwrap().is_some());

        release_tx.send(()).unwrap();
        let removed = delete.await.unwrap();
        assert_eq!(removed.messages, 1);
        turn.await.unwrap();
        assert!(f.store.get_conversation(&f.conv.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_requires_a_service_user() {
        let f = fixture().await;
        let err = f
            .service
            .list_conversations(&f.ctx, " ", &PageRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let convs = f
            .service
            .list_conversations(&f.ctx, "alice", &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(convs.len(), 1);
    }
}
