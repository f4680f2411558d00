use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chatloom_agents::RequestContext;
use chatloom_common::Error;
use tracing::debug;

use crate::error::ApiError;
use crate::state::SharedState;

/// The agent behind the request's API key.
pub struct Authenticated(pub RequestContext);

/// API key from `Authorization: Bearer <key>` or `X-Api-Key`.
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });
    bearer
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

impl FromRequestParts<SharedState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let key = api_key_from_headers(&parts.headers)
            .ok_or_else(|| Error::Unauthorized("missing API key".into()))?;
        match state.directory.authenticate(key).await? {
            Some(agent) => Ok(Authenticated(RequestContext::new(agent))),
            None => {
                debug!("rejected unknown API key");
                Err(Error::Unauthorized("invalid API key".into()).into())
            }
        }
    }
}
