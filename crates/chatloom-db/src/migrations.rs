use chatloom_common::{Error, Result};
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS llm_providers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    api_key TEXT,
    base_url TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_models (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    provider_id TEXT NOT NULL REFERENCES llm_providers(id),
    created_at TEXT NOT NULL,
    UNIQUE (name, provider_id)
);

CREATE TABLE IF NOT EXISTS mcp_servers (
    id TEXT PRIMARY KEY,
    config_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL UNIQUE,
    transport TEXT NOT NULL,
    url TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    command TEXT,
    args TEXT NOT NULL DEFAULT '[]',
    env TEXT NOT NULL DEFAULT '{}',
    timeout_secs INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mcp_server_tools (
    id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL REFERENCES mcp_servers(id),
    name TEXT NOT NULL,
    UNIQUE (server_id, name)
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    application_id TEXT NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    chat_model_id TEXT REFERENCES chat_models(id),
    temperature REAL,
    top_p REAL,
    context_length_limit INTEGER,
    max_output_tokens INTEGER,
    default_streamable INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_mcp_tools (
    agent_id TEXT NOT NULL REFERENCES agents(id),
    tool_id TEXT NOT NULL REFERENCES mcp_server_tools(id),
    enabled INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (agent_id, tool_id)
);

CREATE TABLE IF NOT EXISTS api_keys (
    key_hash TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    service_user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner
    ON conversations(agent_id, service_user_id, created_at);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    role TEXT,
    content TEXT,
    attachments TEXT,
    call_id TEXT,
    tool_name TEXT,
    arguments TEXT,
    output TEXT,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    total_tokens INTEGER,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_request
    ON messages(request_id);

CREATE TABLE IF NOT EXISTS attachments (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    application_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    extension TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    kind TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    processing_error TEXT,
    content TEXT,
    message_id TEXT,
    conversation_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_conversation
    ON attachments(conversation_id);
";

/// Apply the schema. Every statement is idempotent.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| Error::Database(format!("migration failed: {e}")))
}
