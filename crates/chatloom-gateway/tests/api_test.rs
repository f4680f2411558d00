use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chatloom_agents::ProviderRegistry;
use chatloom_config::AppConfig;
use chatloom_db::{AgentProfile, SqliteStore};
use chatloom_gateway::{AppState, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

const API_KEY: &str = "clk-gateway-test-key-0001";

struct TestApp {
    router: Router,
    _dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    // oneshot requests carry no peer address for the per-IP limiter
    config.gateway.rate_limit.enabled = false;
    config.gateway.max_upload_bytes = 1024;
    config.storage.attachment_dir = dir.path().to_path_buf();

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let agent = store
        .upsert_agent(AgentProfile {
            id: String::new(),
            name: "helper".into(),
            application_id: "default".into(),
            system_prompt: "You are helpful.".into(),
            chat_model_id: None,
            temperature: None,
            top_p: None,
            context_length_limit: None,
            max_output_tokens: None,
            default_streamable: true,
        })
        .unwrap();
    store.insert_api_key(&agent.id, API_KEY).unwrap();

    let state = AppState::new(config, store, ProviderRegistry::with_defaults()).shared();
    TestApp {
        router: build_router(state),
        _dir: dir,
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {API_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Parse `data: <json>` frames out of an SSE body.
fn sse_events(body: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

async fn send_predefined(app: &TestApp, user: &str, answer: &str) -> Vec<Value> {
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/chat/messages",
            json!({
                "service_user_id": user,
                "message": "hello there",
                "streamable": false,
                "predefined_answer": answer,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    sse_events(&body_bytes(response).await)
}

#[tokio::test]
async fn health_needs_no_key() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"ok");
}

#[tokio::test]
async fn missing_or_unknown_key_is_unauthorized() {
    let app = test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/conversations?service_user_id=alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/conversations?service_user_id=alice")
                .header("x-api-key", "clk-not-a-real-key-000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn predefined_answer_streams_one_answer_event() {
    let app = test_app();
    let events = send_predefined(&app, "alice", "OK").await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message_type"], "answer");
    assert_eq!(events[0]["content"], "OK");
    let conversation_id = events[0]["conversation_id"].as_str().unwrap().to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/conversations/{conversation_id}/messages"))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let messages = body_json(response).await;
    assert_eq!(messages.as_array().unwrap().len(), 2);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/conversations?service_user_id=alice")
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let conversations = body_json(response).await;
    assert_eq!(conversations[0]["id"], conversation_id.as_str());
    assert_eq!(conversations[0]["title"], "hello there");
}

#[tokio::test]
async fn empty_message_is_bad_request() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/chat/messages",
            json!({ "service_user_id": "alice", "message": "  " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn other_users_cannot_rename_or_delete() {
    let app = test_app();
    let events = send_predefined(&app, "alice", "OK").await;
    let conversation_id = events[0]["conversation_id"].as_str().unwrap().to_string();
    let uri = format!("/api/v1/conversations/{conversation_id}");

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &uri,
            json!({ "service_user_id": "mallory", "title": "mine now" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("{uri}?service_user_id=mallory"))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &uri,
            json!({ "service_user_id": "alice", "title": "Renamed" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["title"], "Renamed");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("{uri}?service_user_id=alice"))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["deleted_messages"], 2);
    assert_eq!(body["deleted_attachments"], 0);
}

#[tokio::test]
async fn upload_accepts_text_and_rejects_unknown_field() {
    let app = test_app();
    let boundary = "chatloom-boundary";
    let multipart = |field: &str| {
        format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             meeting at noon\r\n\
             --{boundary}--\r\n"
        )
    };
    let upload = |body: String| {
        Request::post("/api/v1/attachments")
            .header("x-api-key", API_KEY)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    };

    let response = app.router.clone().oneshot(upload(multipart("file"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let attachment = body_json(response).await;
    assert_eq!(attachment["file_name"], "notes.txt");
    assert_eq!(attachment["extension"], ".txt");
    assert_eq!(attachment["processed"], true);
    assert!(attachment.get("storage_path").is_none());

    let response = app
        .router
        .clone()
        .oneshot(upload(multipart("other")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
