use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chatloom_common::{Error, Result};
use ring::digest::{SHA256, digest};
use ring::rand::{SecureRandom, SystemRandom};

pub const API_KEY_PREFIX: &str = "clk-";
const KEY_BYTES: usize = 24;

/// Generate a new random agent API key.
pub fn generate_api_key() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; KEY_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| Error::Config("failed to generate api key".into()))?;
    Ok(format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

/// Hex SHA-256 of the key. Only hashes are persisted.
pub fn hash_api_key(key: &str) -> String {
    let hash = digest(&SHA256, key.trim().as_bytes());
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}
