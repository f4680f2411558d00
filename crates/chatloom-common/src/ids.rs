use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::{Error, Result};

const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Fresh random identifier in canonical hyphenated form.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Validate that `raw` is a UUID, returning it in canonical form.
pub fn parse_id(raw: &str, what: &str) -> Result<String> {
    Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| Error::Validation(format!("invalid {what} id: {raw}")))
}

/// Base62 encoding of the UUID's 128-bit value.
///
/// Used as the short external id of MCP server configurations, which keeps
/// composite tool names inside vendor function-name length limits.
pub fn short_id(id: &Uuid) -> String {
    let mut value = id.as_u128();
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(22);
    while value > 0 {
        digits.push(BASE62_ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Current UTC time, fixed-width so lexical order equals chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
