pub mod api_keys;
pub mod redaction;

pub use api_keys::{API_KEY_PREFIX, generate_api_key, hash_api_key};
pub use redaction::{RedactingWriter, redact_secrets};
