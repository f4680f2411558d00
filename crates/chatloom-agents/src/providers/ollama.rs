use async_trait::async_trait;
use bytes::Bytes;
use chatloom_common::{Error, Result};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    ChatMessage, ChatRole, Choice, FinishReason, LlmProvider, LlmRequest, LlmResponse, LlmStream,
    StreamChoice, StreamChunk, StreamDelta, ToolCall, ToolCallDelta, Usage,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn build_request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });

        let mut options = serde_json::Map::new();
        if let Some(temp) = request.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(top_p) = request.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }

        if let Some(obj) = body.as_object_mut() {
            if !options.is_empty() {
                obj.insert("options".to_string(), Value::Object(options));
            }
            if !request.tools.is_empty() {
                let tools: Vec<Value> = request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                obj.insert("tools".to_string(), Value::Array(tools));
            }
        }

        body
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("Ollama request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Agent(format!(
                "Ollama error status: {}",
                res.status()
            )));
        }
        Ok(res)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("failed to list models: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Agent(format!(
                "Ollama error status: {}",
                res.status()
            )));
        }

        let models_res: OllamaModelsResponse = res
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse models response: {e}")))?;

        Ok(models_res.models.into_iter().map(|m| m.name).collect())
    }
}

fn message_to_json(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut obj = json!({ "role": role, "content": msg.content });

    // Ollama takes tool arguments as an object, not a string.
    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                let arguments = serde_json::from_str::<Value>(&tc.arguments)
                    .unwrap_or_else(|_| json!({}));
                json!({ "function": { "name": tc.name, "arguments": arguments } })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    prompt_eval_count: u32,
}

impl OllamaResponse {
    fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_eval_count,
            completion_tokens: self.eval_count,
            total_tokens: self.prompt_eval_count + self.eval_count,
        }
    }
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaToolCall {
    /// Ollama does not assign call ids, so one is generated per call.
    fn into_tool_call(self) -> ToolCall {
        let arguments = match self.function.arguments {
            Value::Null => "{}".to_string(),
            Value::String(raw) => raw,
            other => other.to_string(),
        };
        ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            kind: "function".to_string(),
            name: self.function.name,
            arguments,
        }
    }
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

fn finish_reason(res: &OllamaResponse, has_tool_calls: bool) -> Option<FinishReason> {
    if has_tool_calls {
        return Some(FinishReason::ToolCalls);
    }
    res.done.then(|| {
        res.done_reason
            .as_deref()
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop)
    })
}

fn line_to_chunk(line: &str) -> Result<StreamChunk> {
    let res: OllamaResponse = serde_json::from_str(line)
        .map_err(|e| Error::Agent(format!("failed to parse stream chunk: {e}")))?;
    let usage = res.done.then(|| res.usage());
    let has_tool_calls = res
        .message
        .as_ref()
        .is_some_and(|m| !m.tool_calls.is_empty());
    let reason = finish_reason(&res, has_tool_calls);

    let (content, tool_calls) = match res.message {
        Some(message) => {
            let calls = message
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, tc)| {
                    let call = tc.into_tool_call();
                    ToolCallDelta {
                        index: index as u32,
                        id: Some(call.id),
                        kind: Some(call.kind),
                        name: Some(call.name),
                        arguments: Some(call.arguments),
                    }
                })
                .collect();
            (message.content, calls)
        }
        None => (String::new(), Vec::new()),
    };

    Ok(StreamChunk {
        choices: vec![StreamChoice {
            index: 0,
            delta: StreamDelta {
                content: (!content.is_empty()).then_some(content),
                tool_calls,
            },
            finish_reason: reason,
        }],
        usage,
    })
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request_body(request, false);
        let res = self.post_chat(&body).await?;

        let ollama_res: OllamaResponse = res
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse Ollama response: {e}")))?;

        let usage = ollama_res.usage();
        let (content, tool_calls) = match ollama_res.message {
            Some(msg) => (
                msg.content,
                msg.tool_calls
                    .into_iter()
                    .map(OllamaToolCall::into_tool_call)
                    .collect::<Vec<_>>(),
            ),
            None => (String::new(), Vec::new()),
        };
        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };

        Ok(LlmResponse {
            model: ollama_res.model,
            choices: vec![Choice {
                message: ChatMessage {
                    role: ChatRole::Assistant,
                    content,
                    tool_calls,
                    tool_call_id: None,
                },
                finish_reason,
            }],
            usage: Some(usage),
        })
    }

    async fn complete_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let body = self.build_request_body(request, true);
        let res = self.post_chat(&body).await?;

        let bytes: BoxStream<'static, Result<Bytes>> = Box::pin(
            res.bytes_stream()
                .map(|r| r.map_err(|e| Error::Agent(format!("stream error: {e}")))),
        );

        // unfold state: (stream, buffer)
        let lines = futures::stream::unfold(
            (bytes, Vec::new()),
            |(mut stream, mut buffer): (BoxStream<'static, Result<Bytes>>, Vec<u8>)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=pos).collect();
                        let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1])
                            .trim()
                            .to_string();
                        if !line.is_empty() {
                            return Some((Ok(line), (stream, buffer)));
                        }
                        continue;
                    }

                    match stream.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => return Some((Err(e), (stream, buffer))),
                        None => {
                            if buffer.is_empty() {
                                return None;
                            }
                            let line = String::from_utf8_lossy(&std::mem::take(&mut buffer))
                                .trim()
                                .to_string();
                            if line.is_empty() {
                                return None;
                            }
                            return Some((Ok(line), (stream, buffer)));
                        }
                    }
                }
            },
        );

        let chunks = lines.map(|line: Result<String>| line.and_then(|l| line_to_chunk(&l)));
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.list_models().await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolDefinition;
    use axum::{
        Json, Router,
        routing::{get, post},
    };
    use tokio::sync::oneshot;

    fn request(messages: Vec<ChatMessage>) -> LlmRequest {
        LlmRequest {
            model: "llama3".to_string(),
            messages,
            tools: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            tool_choice: Default::default(),
        }
    }

    #[test]
    fn request_body_carries_options_and_tools() {
        let provider = OllamaProvider::new(None);
        let mut req = request(vec![ChatMessage::user("Hello")]);
        req.temperature = Some(0.7);
        req.top_p = Some(0.5);
        req.max_tokens = Some(100);
        req.tools.push(ToolDefinition {
            name: "lookup".into(),
            description: "Look something up".into(),
            parameters: json!({"type": "object"}),
        });

        let body = provider.build_request_body(&req, false);

        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["top_p"], 0.5);
        assert_eq!(body["options"]["num_predict"], 100);
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
    }

    #[test]
    fn assistant_tool_call_arguments_become_objects() {
        let msg = ChatMessage::assistant_tool_call(
            "",
            ToolCall {
                id: "c1".into(),
                kind: "function".into(),
                name: "lookup".into(),
                arguments: r#"{"q":"rust"}"#.into(),
            },
        );
        let json = message_to_json(&msg);
        assert_eq!(json["tool_calls"][0]["function"]["arguments"]["q"], "rust");
    }

    #[test]
    fn stream_line_with_tool_call_finishes_as_tool_call() {
        let chunk = line_to_chunk(
            r#"{"model":"llama3","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"lookup","arguments":{"q":1}}}]},"done":false}"#,
        )
        .unwrap();
        let choice = &chunk.choices[0];
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(choice.delta.tool_calls[0].name.as_deref(), Some("lookup"));
        assert_eq!(choice.delta.tool_calls[0].arguments.as_deref(), Some(r#"{"q":1}"#));
        assert!(choice.delta.tool_calls[0].id.is_some());
    }

    async fn run_mock_server() -> (String, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route(
                "/api/tags",
                get(|| async {
                    Json(json!({
                        "models": [
                            { "name": "llama3:latest" },
                            { "name": "mistral:latest" }
                        ]
                    }))
                }),
            )
            .route(
                "/api/chat",
                post(|Json(payload): Json<Value>| async move {
                    let stream = payload
                        .get("stream")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if stream {
                        "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\" World\"},\"done\":true,\"prompt_eval_count\":4,\"eval_count\":2}".to_string()
                    } else {
                        json!({
                            "model": "llama3",
                            "message": { "role": "assistant", "content": "Hello World" },
                            "done": true,
                            "prompt_eval_count": 10,
                            "eval_count": 5
                        })
                        .to_string()
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        (format!("http://{addr}"), tx)
    }

    #[tokio::test]
    async fn list_models_reads_tags() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(Some(url));

        let models = provider.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert!(models.contains(&"llama3:latest".to_string()));
        assert!(provider.health_check().await.unwrap());

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn complete_returns_text_and_usage() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(Some(url));

        let res = provider
            .complete(&request(vec![ChatMessage::user("Hi")]))
            .await
            .unwrap();

        assert_eq!(res.choices[0].message.content, "Hello World");
        assert_eq!(res.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(res.usage.unwrap().total_tokens, 15);

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn stream_concatenates_ndjson_lines() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(Some(url));

        let mut stream = provider.complete_stream(&request(vec![])).await.unwrap();

        let mut full_text = String::new();
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(text) = &chunk.choices[0].delta.content {
                full_text.push_str(text);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }

        assert_eq!(full_text, "Hello World");
        assert_eq!(usage.unwrap().total_tokens, 6);

        let _ = stop.send(());
    }
}
