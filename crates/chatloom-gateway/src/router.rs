use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, patch, post};
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api;
use crate::state::SharedState;

/// Room for multipart framing on top of the file size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    let gateway = state.config.gateway.clone();
    let upload_limit = gateway.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/chat/messages", post(api::send_message))
        .route(
            "/attachments",
            post(api::upload_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/conversations", get(api::list_conversations))
        .route(
            "/conversations/{id}",
            patch(api::rename_conversation).delete(api::delete_conversation),
        )
        .route("/conversations/{id}/messages", get(api::list_messages));

    let mut router = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&gateway.cors_origins) {
        router = router.layer(cors);
    }

    // Per-IP rate limit; needs the peer address from `ConnectInfo`.
    let rl = &gateway.rate_limit;
    if rl.enabled {
        match GovernorConfigBuilder::default()
            .per_second(rl.per_second)
            .burst_size(rl.burst_size)
            .finish()
        {
            Some(governor_conf) => {
                let governor_limiter = governor_conf.limiter().clone();
                router = router.layer(GovernorLayer::new(governor_conf));

                // Drop limiter state for inactive IPs.
                tokio::spawn(async move {
                    let interval = Duration::from_secs(60);
                    loop {
                        tokio::time::sleep(interval).await;
                        governor_limiter.retain_recent();
                    }
                });
            }
            None => warn!("invalid rate limit settings, rate limiting disabled"),
        }
    }

    router
}

async fn health() -> &'static str {
    "ok"
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_needs_a_valid_origin() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_none());
        assert!(cors_layer(&["https://app.example.com".to_string()]).is_some());
    }
}
