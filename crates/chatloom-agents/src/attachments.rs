use std::path::{Path, PathBuf};

use chatloom_common::{Error, Result, new_id};
use chatloom_db::{Attachment, AttachmentKind, NewAttachment};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::RequestContext;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Text prepended to the user prompt ahead of the attachment manifest.
pub const ATTACHMENT_PROMPT_LABEL: &str =
    "The user attached the following files (use their ids with the read_attachment tool):";

/// Classify a lowercased extension (with leading dot) and pick its MIME type.
pub fn classify_extension(ext: &str) -> (AttachmentKind, &'static str) {
    let mime = match ext {
        ".pdf" => "application/pdf",
        ".doc" => "application/msword",
        ".docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".xls" => "application/vnd.ms-excel",
        ".xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".ppt" => "application/vnd.ms-powerpoint",
        ".pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ".txt" => "text/plain",
        ".md" => "text/markdown",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".bmp" => "image/bmp",
        ".webp" => "image/webp",
        _ => DEFAULT_MIME,
    };
    let kind = match ext {
        ".doc" | ".docx" | ".pdf" | ".txt" | ".md" | ".xls" | ".xlsx" | ".ppt" | ".pptx" => {
            AttachmentKind::Document
        }
        ".jpg" | ".jpeg" | ".png" | ".gif" | ".bmp" | ".webp" => AttachmentKind::Image,
        _ => AttachmentKind::Other,
    };
    (kind, mime)
}

fn is_plain_text(ext: &str) -> bool {
    matches!(ext, ".txt" | ".md")
}

/// Lowercased extension of a file name, with its leading dot.
fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}

/// Raw upload as received from the HTTP layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Entry of the manifest recorded on a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub name: String,
}

impl From<&Attachment> for ManifestEntry {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            name: attachment.file_name.clone(),
        }
    }
}

/// `[{"id","name"}]`
pub fn manifest_json(entries: &[ManifestEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

/// Prompt text sent to the model: the manifest ahead of the user's message.
pub fn prompt_with_manifest(manifest: &str, message: &str) -> String {
    format!("{ATTACHMENT_PROMPT_LABEL}{manifest}\n\n{message}")
}

/// Blob storage for uploaded files under `{root}/{attachment_id}/file{ext}`.
#[derive(Debug, Clone)]
pub struct AttachmentStorage {
    root: PathBuf,
    max_bytes: usize,
}

impl AttachmentStorage {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validate an upload, write it to disk and describe the new record.
    pub async fn save(&self, ctx: &RequestContext, file: UploadedFile) -> Result<NewAttachment> {
        let file_name = file.file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(Error::Validation("file name is required".into()));
        }
        let extension = extension_of(&file_name)
            .ok_or_else(|| Error::Validation(format!("file '{file_name}' has no extension")))?;
        if file.bytes.len() > self.max_bytes {
            return Err(Error::Validation(format!(
                "file exceeds the {} byte upload limit",
                self.max_bytes
            )));
        }

        let id = new_id();
        let dir = self.root.join(&id);
        let path = dir.join(format!("file{extension}"));
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, &file.bytes).await?;
        debug!(attachment_id = %id, path = %path.display(), "stored attachment");

        let (kind, mime) = classify_extension(&extension);
        let content = is_plain_text(&extension)
            .then(|| String::from_utf8_lossy(&file.bytes).into_owned());

        Ok(NewAttachment {
            id,
            agent_id: ctx.agent_id().to_string(),
            application_id: ctx.application_id.clone(),
            file_name,
            extension,
            size_bytes: file.bytes.len() as u64,
            mime_type: mime.to_string(),
            storage_path: path.to_string_lossy().into_owned(),
            kind,
            processed: content.is_some(),
            processing_error: None,
            content,
        })
    }

    /// Remove an attachment's directory. A missing directory is not an error.
    pub async fn remove(&self, attachment_id: &str) -> Result<()> {
        if attachment_id.is_empty() || attachment_id.contains(['/', '\\', '.']) {
            return Err(Error::Validation(format!(
                "invalid attachment id: {attachment_id}"
            )));
        }
        match tokio::fs::remove_dir_all(self.root.join(attachment_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(attachment_id, "attachment directory already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_db::AgentProfile;

    fn ctx() -> RequestContext {
        RequestContext::new(AgentProfile {
            id: "agent-1".into(),
            name: "helper".into(),
            application_id: "app-1".into(),
            system_prompt: String::new(),
            chat_model_id: None,
            temperature: None,
            top_p: None,
            context_length_limit: None,
            max_output_tokens: None,
            default_streamable: true,
        })
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify_extension(".png"), (AttachmentKind::Image, "image/png"));
        assert_eq!(
            classify_extension(".md"),
            (AttachmentKind::Document, "text/markdown")
        );
        assert_eq!(
            classify_extension(".zip"),
            (AttachmentKind::Other, "application/octet-stream")
        );
    }

    #[tokio::test]
    async fn save_writes_file_and_derives_text() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AttachmentStorage::new(dir.path(), 1024);
        let new = storage
            .save(
                &ctx(),
                UploadedFile {
                    file_name: "Notes.TXT".into(),
                    bytes: b"hello".to_vec(),
                },
            )
            .await
            .unwrap();

        assert_eq!(new.extension, ".txt");
        assert_eq!(new.kind, AttachmentKind::Document);
        assert_eq!(new.content.as_deref(), Some("hello"));
        assert!(new.processed);
        let expected = dir.path().join(&new.id).join("file.txt");
        assert_eq!(std::fs::read(&expected).unwrap(), b"hello");

        storage.remove(&new.id).await.unwrap();
        assert!(!expected.exists());
        storage.remove(&new.id).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AttachmentStorage::new(dir.path(), 4);
        for (name, bytes) in [("", b"a".to_vec()), ("README", b"a".to_vec()), ("big.png", vec![0; 5])] {
            let err = storage
                .save(
                    &ctx(),
                    UploadedFile {
                        file_name: name.into(),
                        bytes,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{name}");
        }
    }

    #[test]
    fn manifest_prefixes_prompt() {
        let manifest = manifest_json(&[ManifestEntry {
            id: "a1".into(),
            name: "x.txt".into(),
        }])
        .unwrap();
        assert_eq!(manifest, r#"[{"id":"a1","name":"x.txt"}]"#);
        let prompt = prompt_with_manifest(&manifest, "summarize");
        assert!(prompt.ends_with("\n\nsummarize"));
        assert!(prompt.contains(&manifest));
    }
}
