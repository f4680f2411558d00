//! In-process MCP-over-SSE server for tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

#[derive(Clone)]
struct Mock {
    outbox: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    tools: Arc<Vec<Value>>,
}

/// Serve the named tools on an ephemeral port. `tools/call` echoes the
/// `text` argument. Returns the address; the SSE stream lives at `/sse`.
pub(crate) async fn spawn(tools: &[&str]) -> SocketAddr {
    let tools = tools
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("{name} things"),
                "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
            })
        })
        .collect();
    let mock = Mock {
        outbox: Arc::new(Mutex::new(None)),
        tools: Arc::new(tools),
    };
    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(message_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn sse_handler(
    State(mock): State<Mock>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<String>(16);
    *mock.outbox.lock().await = Some(tx);
    let endpoint = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data("/messages?sessionId=1"))
    });
    let messages = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|data| Ok::<Event, Infallible>(Event::default().event("message").data(data)));
    Sse::new(endpoint.chain(messages))
}

async fn message_handler(State(mock): State<Mock>, Json(body): Json<Value>) -> &'static str {
    let Some(id) = body.get("id").cloned() else {
        return "accepted";
    };
    let result = match body["method"].as_str() {
        Some("initialize") => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "1.0.0"}
        }),
        Some("tools/list") => json!({ "tools": mock.tools.as_slice() }),
        Some("tools/call") => json!({
            "content": [{"type": "text", "text": body["params"]["arguments"]["text"]}],
            "isError": false
        }),
        _ => json!({}),
    };
    let reply = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
    if let Some(tx) = mock.outbox.lock().await.as_ref() {
        let _ = tx.send(reply).await;
    }
    "accepted"
}
