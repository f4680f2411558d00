//! Legacy MCP-over-SSE client: a long-lived GET event stream announces a POST
//! endpoint, requests go out as POSTs and responses come back on the stream.

use std::borrow::Cow;
use std::time::Duration;

use chatloom_common::{Error, Result};
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientJsonRpcMessage,
    ClientNotification, ClientRequest, Implementation, InitializeRequestParam,
    InitializedNotification, JsonObject, ListToolsRequest, ListToolsResult, ProtocolVersion,
    Request, RequestId, ServerJsonRpcMessage, ServerResult,
};
use sse_stream::SseStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) struct SseSession {
    endpoint: url::Url,
    receiver: mpsc::Receiver<ServerJsonRpcMessage>,
    client: reqwest::Client,
    task: tokio::task::JoinHandle<()>,
    timeout: Duration,
    next_id: i64,
}

fn request_id_matches(expected: &RequestId, actual: &RequestId) -> bool {
    if expected == actual {
        return true;
    }
    match (expected, actual) {
        (RequestId::Number(expected), RequestId::String(actual))
        | (RequestId::String(actual), RequestId::Number(expected)) => actual
            .parse::<i64>()
            .ok()
            .is_some_and(|value| value == *expected),
        _ => false,
    }
}

impl SseSession {
    /// Open the event stream and wait for the server's `endpoint` event.
    pub(crate) async fn connect(url: &str, headers: HeaderMap, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Mcp(format!("failed to build SSE client: {e}")))?;

        let response = tokio::time::timeout(
            timeout,
            client
                .get(url)
                .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
                .send(),
        )
        .await
        .map_err(|_| Error::Mcp(format!("SSE connect to {url} timed out")))?
        .map_err(|e| Error::Mcp(format!("SSE connect to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Mcp(format!(
                "SSE connect to {url} failed with status {status}"
            )));
        }

        let base_url = url::Url::parse(url)
            .map_err(|e| Error::Mcp(format!("invalid SSE url '{url}': {e}")))?;
        let (tx, rx) = mpsc::channel(64);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<url::Url>>();

        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = SseStream::from_byte_stream(response.bytes_stream());
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("MCP SSE stream failed: {err}");
                        break;
                    }
                };
                let event_name = event.event.as_deref().unwrap_or("message");
                match event_name {
                    "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let data = event.data.unwrap_or_default();
                            let _ = tx.send(resolve_endpoint(&base_url, &data));
                        }
                    }
                    "message" | "" => {
                        let Some(data) = event.data.filter(|d| !d.trim().is_empty()) else {
                            continue;
                        };
                        match serde_json::from_str::<ServerJsonRpcMessage>(&data) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("unparseable MCP SSE message: {err}"),
                        }
                    }
                    other => debug!("ignoring MCP SSE event '{other}'"),
                }
            }
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(Err(Error::Mcp("SSE stream ended before endpoint event".into())));
            }
        });

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Mcp("SSE reader stopped before endpoint event".into())),
            Err(_) => Err(Error::Mcp("timed out waiting for SSE endpoint event".into())),
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        };

        info!(endpoint = %endpoint, "MCP SSE session connected");
        Ok(Self {
            endpoint,
            receiver: rx,
            client,
            task: handle,
            timeout,
            next_id: 1,
        })
    }

    pub(crate) async fn initialize(&mut self) -> Result<()> {
        let params = InitializeRequestParam {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_build_env(),
        };
        match self
            .request(ClientRequest::InitializeRequest(Request::new(params)))
            .await?
        {
            ServerResult::InitializeResult(_) => {}
            other => {
                return Err(Error::Mcp(format!(
                    "unexpected initialize result: {other:?}"
                )));
            }
        }
        self.notify(ClientNotification::InitializedNotification(
            InitializedNotification::default(),
        ))
        .await
    }

    pub(crate) async fn list_tools(&mut self) -> Result<ListToolsResult> {
        match self
            .request(ClientRequest::ListToolsRequest(ListToolsRequest::default()))
            .await?
        {
            ServerResult::ListToolsResult(tools) => Ok(tools),
            other => Err(Error::Mcp(format!("unexpected tools/list result: {other:?}"))),
        }
    }

    pub(crate) async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        let params = CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments,
        };
        match self
            .request(ClientRequest::CallToolRequest(Request::new(params)))
            .await?
        {
            ServerResult::CallToolResult(output) => Ok(output),
            other => Err(Error::Mcp(format!("unexpected tools/call result: {other:?}"))),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    async fn request(&mut self, request: ClientRequest) -> Result<ServerResult> {
        let request_id = self.next_request_id();
        let message = ClientJsonRpcMessage::request(request, request_id.clone());
        self.send_message(&message).await?;
        self.await_response(request_id).await
    }

    async fn notify(&self, notification: ClientNotification) -> Result<()> {
        self.send_message(&ClientJsonRpcMessage::notification(notification))
            .await
    }

    async fn send_message(&self, message: &ClientJsonRpcMessage) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(self.timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| Error::Mcp(format!("SSE post failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Mcp(format!("SSE post failed with status {status}")));
        }
        Ok(())
    }

    async fn await_response(&mut self, request_id: RequestId) -> Result<ServerResult> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = tokio::time::timeout(remaining, self.receiver.recv())
                .await
                .map_err(|_| Error::Mcp("timed out waiting for SSE response".into()))?;
            let Some(message) = next else {
                return Err(Error::Mcp("SSE connection closed".into()));
            };

            match message {
                ServerJsonRpcMessage::Response(response) => {
                    if request_id_matches(&request_id, &response.id) {
                        return Ok(response.result);
                    }
                    debug!("ignoring unmatched SSE response {}", response.id);
                }
                ServerJsonRpcMessage::Error(error) => {
                    if request_id_matches(&request_id, &error.id) {
                        return Err(Error::Mcp(format!(
                            "server returned error: {}",
                            error.error.message
                        )));
                    }
                    debug!("ignoring unmatched SSE error {}", error.id);
                }
                ServerJsonRpcMessage::Request(request) => {
                    warn!("unhandled server request over SSE: {}", request.id);
                }
                ServerJsonRpcMessage::Notification(_) => {}
            }
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        RequestId::String(id.to_string().into())
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolve the announced endpoint against the stream URL. Cross-origin
/// endpoints are refused.
fn resolve_endpoint(base_url: &url::Url, raw: &str) -> Result<url::Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Mcp("empty SSE endpoint".into()));
    }
    let endpoint = url::Url::parse(trimmed)
        .or_else(|_| base_url.join(trimmed))
        .map_err(|e| Error::Mcp(format!("invalid SSE endpoint '{trimmed}': {e}")))?;
    if endpoint.scheme() != base_url.scheme()
        || endpoint.host_str() != base_url.host_str()
        || endpoint.port_or_known_default() != base_url.port_or_known_default()
    {
        return Err(Error::Mcp(format!(
            "SSE endpoint {endpoint} is not same-origin"
        )));
    }
    Ok(endpoint)
}
