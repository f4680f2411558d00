use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("mcp error: {0}")]
    Mcp(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Database(_) => "database_error",
            Error::Agent(_) => "agent_error",
            Error::Mcp(_) => "mcp_error",
            Error::Tool(_) => "tool_error",
            Error::Validation(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::Unauthorized(_) => "unauthorized",
            Error::NotImplemented(_) => "not_implemented",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the message is safe to show to API callers verbatim.
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound(_)
                | Error::Forbidden(_)
                | Error::Unauthorized(_)
                | Error::NotImplemented(_)
        )
    }

    /// Message shown to callers. Internal failures are reduced to a generic
    /// sentence so vendor bodies and file paths stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Agent(_) => "the language model request failed".to_string(),
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) => {
                "internal server error".to_string()
            }
            Error::Mcp(_) => "tool server unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
