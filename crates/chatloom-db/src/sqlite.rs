use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chatloom_common::{Error, Result, new_id, now_timestamp, short_id};
use chatloom_security::hash_api_key;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::migrations;
use crate::models::{
    AgentProfile, Attachment, AttachmentKind, ChatModel, Conversation, LlmProviderConfig,
    McpServerConfig, McpServerTool, MessageBody, MessageRole, NewAttachment, NewConversation,
    NewMessage, PageRequest, StoredMessage, TokenUsage,
};
use crate::store::{AgentDirectory, AttachmentStore, MessageStore};

const CONVERSATION_COLUMNS: &str =
    "id, agent_id, application_id, service_user_id, title, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, agent_id, application_id, request_id, kind, \
     role, content, attachments, call_id, tool_name, arguments, output, \
     prompt_tokens, completion_tokens, total_tokens, created_at";

const ATTACHMENT_COLUMNS: &str = "id, agent_id, application_id, file_name, extension, size_bytes, \
     mime_type, storage_path, kind, processed, processing_error, content, message_id, \
     conversation_id, created_at";

const AGENT_SELECT: &str = "SELECT a.id, a.name, a.application_id, a.system_prompt, \
     a.chat_model_id, a.temperature, a.top_p, a.context_length_limit, a.max_output_tokens, \
     a.default_streamable FROM agents a";

const MCP_SERVER_COLUMNS: &str =
    "id, config_id, name, transport, url, headers, command, args, env, timeout_secs";

/// SQLite-backed implementation of every store trait.
///
/// A single connection is shared behind a mutex; each call holds the lock
/// only for the duration of its statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening chatloom database at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection mutex poisoned".into()))
    }

    /// Insert or update a provider by name, returning its id.
    pub fn upsert_provider(
        &self,
        name: &str,
        kind: &str,
        api_key: Option<&str>,
        base_url: Option<&str>,
    ) -> Result<String> {
        let conn = self.lock()?;
        let existing = id_by_name(&conn, "llm_providers", name)?;
        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE llm_providers SET kind = ?2, api_key = ?3, base_url = ?4 WHERE id = ?1",
                    params![id, kind, api_key, base_url],
                )
                .map_err(|e| Error::Database(format!("failed to update provider: {e}")))?;
                id
            }
            None => {
                let id = new_id();
                conn.execute(
                    "INSERT INTO llm_providers (id, name, kind, api_key, base_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, name, kind, api_key, base_url, now_timestamp()],
                )
                .map_err(|e| Error::Database(format!("failed to insert provider: {e}")))?;
                id
            }
        };
        Ok(id)
    }

    /// Insert a chat model unless the (name, provider) pair exists.
    pub fn upsert_chat_model(&self, name: &str, provider_id: &str) -> Result<String> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM chat_models WHERE name = ?1 AND provider_id = ?2",
                params![name, provider_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query chat model: {e}")))?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = new_id();
        conn.execute(
            "INSERT INTO chat_models (id, name, provider_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, provider_id, now_timestamp()],
        )
        .map_err(|e| Error::Database(format!("failed to insert chat model: {e}")))?;
        Ok(id)
    }

    /// Insert or update an MCP server by name. Existing servers keep their
    /// ids so composite tool names stay stable.
    pub fn upsert_mcp_server(&self, mut server: McpServerConfig) -> Result<McpServerConfig> {
        let conn = self.lock()?;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, config_id FROM mcp_servers WHERE name = ?1",
                [&server.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query mcp server: {e}")))?;

        let headers = serde_json::to_string(&server.headers)?;
        let args = serde_json::to_string(&server.args)?;
        let env = serde_json::to_string(&server.env)?;
        let timeout = server.timeout_secs.map(|t| t as i64);

        match existing {
            Some((id, config_id)) => {
                server.id = id;
                server.config_id = config_id;
                conn.execute(
                    "UPDATE mcp_servers SET transport = ?2, url = ?3, headers = ?4, command = ?5,
                       args = ?6, env = ?7, timeout_secs = ?8
                     WHERE id = ?1",
                    params![
                        server.id,
                        server.transport,
                        server.url,
                        headers,
                        server.command,
                        args,
                        env,
                        timeout
                    ],
                )
                .map_err(|e| Error::Database(format!("failed to update mcp server: {e}")))?;
            }
            None => {
                let uuid = uuid::Uuid::new_v4();
                server.id = uuid.to_string();
                server.config_id = short_id(&uuid);
                conn.execute(
                    "INSERT INTO mcp_servers
                       (id, config_id, name, transport, url, headers, command, args, env,
                        timeout_secs, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        server.id,
                        server.config_id,
                        server.name,
                        server.transport,
                        server.url,
                        headers,
                        server.command,
                        args,
                        env,
                        timeout,
                        now_timestamp()
                    ],
                )
                .map_err(|e| Error::Database(format!("failed to insert mcp server: {e}")))?;
            }
        }
        Ok(server)
    }

    pub fn upsert_mcp_tool(&self, server_id: &str, name: &str) -> Result<String> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM mcp_server_tools WHERE server_id = ?1 AND name = ?2",
                params![server_id, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query mcp tool: {e}")))?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = new_id();
        conn.execute(
            "INSERT INTO mcp_server_tools (id, server_id, name) VALUES (?1, ?2, ?3)",
            params![id, server_id, name],
        )
        .map_err(|e| Error::Database(format!("failed to insert mcp tool: {e}")))?;
        Ok(id)
    }

    /// Insert or update an agent by name; the stored profile is returned.
    pub fn upsert_agent(&self, mut profile: AgentProfile) -> Result<AgentProfile> {
        let conn = self.lock()?;
        let existing = id_by_name(&conn, "agents", &profile.name)?;
        let context_limit = profile.context_length_limit;
        let max_tokens = profile.max_output_tokens;
        match existing {
            Some(id) => {
                profile.id = id;
                conn.execute(
                    "UPDATE agents SET application_id = ?2, system_prompt = ?3, chat_model_id = ?4,
                       temperature = ?5, top_p = ?6, context_length_limit = ?7,
                       max_output_tokens = ?8, default_streamable = ?9
                     WHERE id = ?1",
                    params![
                        profile.id,
                        profile.application_id,
                        profile.system_prompt,
                        profile.chat_model_id,
                        profile.temperature,
                        profile.top_p,
                        context_limit,
                        max_tokens,
                        profile.default_streamable
                    ],
                )
                .map_err(|e| Error::Database(format!("failed to update agent: {e}")))?;
            }
            None => {
                if profile.id.is_empty() {
                    profile.id = new_id();
                }
                conn.execute(
                    "INSERT INTO agents
                       (id, name, application_id, system_prompt, chat_model_id, temperature,
                        top_p, context_length_limit, max_output_tokens, default_streamable,
                        created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        profile.id,
                        profile.name,
                        profile.application_id,
                        profile.system_prompt,
                        profile.chat_model_id,
                        profile.temperature,
                        profile.top_p,
                        context_limit,
                        max_tokens,
                        profile.default_streamable,
                        now_timestamp()
                    ],
                )
                .map_err(|e| Error::Database(format!("failed to insert agent: {e}")))?;
            }
        }
        Ok(profile)
    }

    pub fn set_agent_tool(&self, agent_id: &str, tool_id: &str, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_mcp_tools (agent_id, tool_id, enabled) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, tool_id) DO UPDATE SET enabled = excluded.enabled",
            params![agent_id, tool_id, enabled],
        )
        .map_err(|e| Error::Database(format!("failed to bind agent tool: {e}")))?;
        Ok(())
    }

    /// Store the hash of a plaintext API key for an agent.
    pub fn insert_api_key(&self, agent_id: &str, api_key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO api_keys (key_hash, agent_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key_hash) DO UPDATE SET agent_id = excluded.agent_id",
            params![hash_api_key(api_key), agent_id, now_timestamp()],
        )
        .map_err(|e| Error::Database(format!("failed to insert api key: {e}")))?;
        Ok(())
    }

    pub fn agent_by_name(&self, name: &str) -> Result<Option<AgentProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{AGENT_SELECT} WHERE a.name = ?1"),
            [name],
            agent_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to query agent: {e}")))
    }

    pub fn mcp_server_by_name(&self, name: &str) -> Result<Option<McpServerConfig>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MCP_SERVER_COLUMNS} FROM mcp_servers WHERE name = ?1"),
            [name],
            mcp_server_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to query mcp server: {e}")))
    }

    pub fn provider_by_name(&self, name: &str) -> Result<Option<LlmProviderConfig>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, kind, api_key, base_url FROM llm_providers WHERE name = ?1",
            [name],
            provider_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to query provider: {e}")))
    }

    pub fn chat_model_by_name(&self, name: &str) -> Result<Option<ChatModel>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, provider_id FROM chat_models WHERE name = ?1 ORDER BY created_at LIMIT 1",
            [name],
            |row| {
                Ok(ChatModel {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to query chat model: {e}")))
    }
}

fn id_by_name(conn: &Connection, table: &str, name: &str) -> Result<Option<String>> {
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE name = ?1"),
        [name],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to query {table}: {e}")))
}

/// `(created_at, seq)` of a cursor row, when it exists.
fn cursor_position(conn: &Connection, table: &str, id: &str) -> Result<Option<(String, i64)>> {
    conn.query_row(
        &format!("SELECT created_at, seq FROM {table} WHERE id = ?1"),
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to resolve cursor: {e}")))
}

fn page_cursor(
    conn: &Connection,
    table: &str,
    page: &PageRequest,
) -> Result<(Option<String>, Option<i64>)> {
    let Some(last_id) = page.cursor() else {
        return Ok((None, None));
    };
    match cursor_position(conn, table, last_id)? {
        Some((created_at, seq)) => Ok((Some(created_at), Some(seq))),
        None => {
            debug!(last_id, table, "unknown pagination cursor, starting from newest");
            Ok((None, None))
        }
    }
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        application_id: row.get(2)?,
        service_user_id: row.get(3)?,
        title: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let kind: String = row.get(5)?;
    let body = match kind.as_str() {
        "message" => {
            let role: String = row.get(6)?;
            let role = role
                .parse::<MessageRole>()
                .map_err(|e| conversion_error(6, e))?;
            let prompt_tokens: Option<u32> = row.get(13)?;
            let usage = match prompt_tokens {
                Some(prompt_tokens) => Some(TokenUsage {
                    prompt_tokens,
                    completion_tokens: row.get::<_, Option<u32>>(14)?.unwrap_or_default(),
                    total_tokens: row.get::<_, Option<u32>>(15)?.unwrap_or_default(),
                }),
                None => None,
            };
            MessageBody::Message {
                role,
                content: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                attachments: row.get(8)?,
                usage,
            }
        }
        "function_call" => MessageBody::FunctionCall {
            call_id: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            name: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            arguments: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        },
        "function_call_output" => MessageBody::FunctionCallOutput {
            call_id: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            name: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            output: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        },
        other => {
            return Err(conversion_error(
                5,
                Error::Database(format!("unknown message kind '{other}'")),
            ));
        }
    };

    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        agent_id: row.get(2)?,
        application_id: row.get(3)?,
        request_id: row.get(4)?,
        body,
        created_at: row.get(16)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let size: i64 = row.get(5)?;
    let kind: String = row.get(8)?;
    Ok(Attachment {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        application_id: row.get(2)?,
        file_name: row.get(3)?,
        extension: row.get(4)?,
        size_bytes: size.max(0) as u64,
        mime_type: row.get(6)?,
        storage_path: row.get(7)?,
        kind: AttachmentKind::parse(&kind),
        processed: row.get(9)?,
        processing_error: row.get(10)?,
        content: row.get(11)?,
        message_id: row.get(12)?,
        conversation_id: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentProfile> {
    Ok(AgentProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        application_id: row.get(2)?,
        system_prompt: row.get(3)?,
        chat_model_id: row.get(4)?,
        temperature: row.get(5)?,
        top_p: row.get(6)?,
        context_length_limit: row.get(7)?,
        max_output_tokens: row.get(8)?,
        default_streamable: row.get(9)?,
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<LlmProviderConfig> {
    Ok(LlmProviderConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        api_key: row.get(3)?,
        base_url: row.get(4)?,
    })
}

fn mcp_server_from_row(row: &Row<'_>) -> rusqlite::Result<McpServerConfig> {
    let headers: String = row.get(5)?;
    let args: String = row.get(7)?;
    let env: String = row.get(8)?;
    let timeout: Option<i64> = row.get(9)?;
    Ok(McpServerConfig {
        id: row.get(0)?,
        config_id: row.get(1)?,
        name: row.get(2)?,
        transport: row.get(3)?,
        url: row.get(4)?,
        headers: serde_json::from_str(&headers).map_err(|e| conversion_error(5, e))?,
        command: row.get(6)?,
        args: serde_json::from_str(&args).map_err(|e| conversion_error(7, e))?,
        env: serde_json::from_str(&env).map_err(|e| conversion_error(8, e))?,
        timeout_secs: timeout.map(|t| t.max(0) as u64),
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation> {
        let now = now_timestamp();
        let conversation = Conversation {
            id: new_id(),
            agent_id: new.agent_id,
            application_id: new.application_id,
            service_user_id: new.service_user_id,
            title: new.title,
            created_at: now.clone(),
            updated_at: now,
        };
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO conversations ({CONVERSATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                conversation.id,
                conversation.agent_id,
                conversation.application_id,
                conversation.service_user_id,
                conversation.title,
                conversation.created_at,
                conversation.updated_at
            ],
        )
        .map_err(|e| Error::Database(format!("failed to create conversation: {e}")))?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE id = ?1 AND deleted_at IS NULL"
            ),
            [id],
            conversation_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))
    }

    async fn list_conversations(
        &self,
        agent_id: &str,
        service_user_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Conversation>> {
        let conn = self.lock()?;
        let (cursor_at, cursor_seq) = page_cursor(&conn, "conversations", page)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE agent_id = ?1 AND service_user_id = ?2 AND deleted_at IS NULL
                   AND (?3 IS NULL OR created_at < ?3 OR (created_at = ?3 AND seq < ?4))
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?5"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(
                params![
                    agent_id,
                    service_user_id,
                    cursor_at,
                    cursor_seq,
                    page.limit() as i64
                ],
                conversation_from_row,
            )
            .map_err(|e| Error::Database(format!("failed to list conversations: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read conversation row: {e}")))?;
        Ok(rows)
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE conversations SET title = ?2, updated_at = ?3
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, title, now_timestamp()],
            )
            .map_err(|e| Error::Database(format!("failed to rename conversation: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<usize> {
        let mut conn = self.lock()?;
        let now = now_timestamp();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        let messages = tx
            .execute(
                "UPDATE messages SET deleted_at = ?2
                 WHERE conversation_id = ?1 AND deleted_at IS NULL",
                params![id, now],
            )
            .map_err(|e| Error::Database(format!("failed to delete messages: {e}")))?;
        tx.execute(
            "UPDATE conversations SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now],
        )
        .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit delete: {e}")))?;
        Ok(messages)
    }

    async fn append_message(&self, new: NewMessage) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: new_id(),
            conversation_id: new.conversation_id,
            agent_id: new.agent_id,
            application_id: new.application_id,
            request_id: new.request_id,
            body: new.body,
            created_at: now_timestamp(),
        };

        let (role, content, attachments, usage) = match &stored.body {
            MessageBody::Message {
                role,
                content,
                attachments,
                usage,
            } => (
                Some(role.as_str()),
                Some(content.as_str()),
                attachments.as_deref(),
                *usage,
            ),
            _ => (None, None, None, None),
        };
        let (call_id, tool_name, arguments, output) = match &stored.body {
            MessageBody::FunctionCall {
                call_id,
                name,
                arguments,
            } => (
                Some(call_id.as_str()),
                Some(name.as_str()),
                Some(arguments.as_str()),
                None,
            ),
            MessageBody::FunctionCallOutput {
                call_id,
                name,
                output,
            } => (
                Some(call_id.as_str()),
                Some(name.as_str()),
                None,
                Some(output.as_str()),
            ),
            MessageBody::Message { .. } => (None, None, None, None),
        };

        let conn = self.lock()?;
        let live: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1 AND deleted_at IS NULL",
                [&stored.conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to check conversation: {e}")))?;
        if live.is_none() {
            return Err(Error::NotFound(format!(
                "conversation {}",
                stored.conversation_id
            )));
        }
        conn.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                stored.id,
                stored.conversation_id,
                stored.agent_id,
                stored.application_id,
                stored.request_id,
                stored.kind().as_str(),
                role,
                content,
                attachments,
                call_id,
                tool_name,
                arguments,
                output,
                usage.map(|u| u.prompt_tokens),
                usage.map(|u| u.completion_tokens),
                usage.map(|u| u.total_tokens),
                stored.created_at
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert message: {e}")))?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![stored.conversation_id, stored.created_at],
        )
        .map_err(|e| Error::Database(format!("failed to touch conversation: {e}")))?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        agent_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let (cursor_at, cursor_seq) = page_cursor(&conn, "messages", page)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL
                   AND (?3 IS NULL OR created_at < ?3 OR (created_at = ?3 AND seq < ?4))
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?5"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(
                params![
                    conversation_id,
                    agent_id,
                    cursor_at,
                    cursor_seq,
                    page.limit() as i64
                ],
                message_from_row,
            )
            .map_err(|e| Error::Database(format!("failed to list messages: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
        Ok(rows)
    }

    async fn recent_history(
        &self,
        conversation_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND agent_id = ?2 AND deleted_at IS NULL
                   AND kind = 'message' AND role IS NOT NULL
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?3"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let mut rows = stmt
            .query_map(
                params![conversation_id, agent_id, limit as i64],
                message_from_row,
            )
            .map_err(|e| Error::Database(format!("failed to load history: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
        rows.reverse();
        Ok(rows)
    }

    async fn messages_for_request(&self, request_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE request_id = ?1 AND deleted_at IS NULL
                 ORDER BY seq ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([request_id], message_from_row)
            .map_err(|e| Error::Database(format!("failed to load turn: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
        Ok(rows)
    }
}

#[async_trait]
impl AttachmentStore for SqliteStore {
    async fn create_attachment(&self, new: NewAttachment) -> Result<Attachment> {
        let attachment = Attachment {
            id: new.id,
            agent_id: new.agent_id,
            application_id: new.application_id,
            file_name: new.file_name,
            extension: new.extension,
            size_bytes: new.size_bytes,
            mime_type: new.mime_type,
            storage_path: new.storage_path,
            kind: new.kind,
            processed: new.processed,
            processing_error: new.processing_error,
            content: new.content,
            message_id: None,
            conversation_id: None,
            created_at: now_timestamp(),
        };
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO attachments ({ATTACHMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                attachment.id,
                attachment.agent_id,
                attachment.application_id,
                attachment.file_name,
                attachment.extension,
                attachment.size_bytes as i64,
                attachment.mime_type,
                attachment.storage_path,
                attachment.kind.as_str(),
                attachment.processed,
                attachment.processing_error,
                attachment.content,
                attachment.message_id,
                attachment.conversation_id,
                attachment.created_at
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert attachment: {e}")))?;
        Ok(attachment)
    }

    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1"),
            [id],
            attachment_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load attachment: {e}")))
    }

    async fn bind_attachment(
        &self,
        id: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE attachments SET message_id = ?2, conversation_id = ?3 WHERE id = ?1",
                params![id, message_id, conversation_id],
            )
            .map_err(|e| Error::Database(format!("failed to bind attachment: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("attachment {id}")));
        }
        Ok(())
    }

    async fn attachments_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Attachment>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTACHMENT_COLUMNS} FROM attachments
                 WHERE conversation_id = ?1 ORDER BY seq ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([conversation_id], attachment_from_row)
            .map_err(|e| Error::Database(format!("failed to list attachments: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read attachment row: {e}")))?;
        Ok(rows)
    }

    async fn delete_attachment(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM attachments WHERE id = ?1", [id])
            .map_err(|e| Error::Database(format!("failed to delete attachment: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AgentDirectory for SqliteStore {
    async fn agent(&self, id: &str) -> Result<Option<AgentProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{AGENT_SELECT} WHERE a.id = ?1"),
            [id],
            agent_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load agent: {e}")))
    }

    async fn authenticate(&self, api_key: &str) -> Result<Option<AgentProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "{AGENT_SELECT} JOIN api_keys k ON k.agent_id = a.id WHERE k.key_hash = ?1"
            ),
            [hash_api_key(api_key)],
            agent_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to authenticate: {e}")))
    }

    async fn chat_model(&self, id: &str) -> Result<Option<ChatModel>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, provider_id FROM chat_models WHERE id = ?1",
            [id],
            |row| {
                Ok(ChatModel {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load chat model: {e}")))
    }

    async fn llm_provider(&self, id: &str) -> Result<Option<LlmProviderConfig>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, kind, api_key, base_url FROM llm_providers WHERE id = ?1",
            [id],
            provider_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load provider: {e}")))
    }

    async fn llm_providers(&self) -> Result<Vec<LlmProviderConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, kind, api_key, base_url FROM llm_providers ORDER BY name")
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], provider_from_row)
            .map_err(|e| Error::Database(format!("failed to list providers: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read provider row: {e}")))?;
        Ok(rows)
    }

    async fn enabled_mcp_tools(&self, agent_id: &str) -> Result<Vec<McpServerTool>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT t.id, t.server_id, t.name FROM agent_mcp_tools b
                 JOIN mcp_server_tools t ON t.id = b.tool_id
                 WHERE b.agent_id = ?1 AND b.enabled = 1
                 ORDER BY t.server_id, t.name",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([agent_id], |row| {
                Ok(McpServerTool {
                    id: row.get(0)?,
                    server_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .map_err(|e| Error::Database(format!("failed to list agent tools: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read tool row: {e}")))?;
        Ok(rows)
    }

    async fn mcp_server(&self, id: &str) -> Result<Option<McpServerConfig>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MCP_SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
            [id],
            mcp_server_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load mcp server: {e}")))
    }

    async fn mcp_server_by_config_id(&self, config_id: &str) -> Result<Option<McpServerConfig>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MCP_SERVER_COLUMNS} FROM mcp_servers WHERE config_id = ?1"),
            [config_id],
            mcp_server_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load mcp server: {e}")))
    }
}
