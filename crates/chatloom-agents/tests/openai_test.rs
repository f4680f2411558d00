use chatloom_agents::providers::OpenAiProvider;
use chatloom_agents::{
    ChatMessage, FinishReason, LlmProvider, LlmRequest, ToolCallAssembler, ToolDefinition,
};
use chatloom_common::Error;
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(tools: Vec<ToolDefinition>) -> LlmRequest {
    LlmRequest {
        model: "gpt-4o-mini".to_string(),
        messages: vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello"),
        ],
        tools,
        temperature: Some(0.2),
        top_p: None,
        max_tokens: Some(256),
        tool_choice: Default::default(),
    }
}

fn weather_tool() -> ToolDefinition {
    ToolDefinition {
        name: "abc_____get_weather".to_string(),
        description: "Get weather".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"location": {"type": "string"}}
        }),
    }
}

#[tokio::test]
async fn test_openai_completion() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini", "max_tokens": 256})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(Some("test-key".to_string()), Some(mock_server.uri()));
    let response = provider.complete(&request(vec![])).await.unwrap();

    assert_eq!(response.choices.len(), 1);
    assert_eq!(response.choices[0].message.content, "Hello there!");
    assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.unwrap().total_tokens, 21);
}

#[tokio::test]
async fn test_openai_tool_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"tool_choice": "auto"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc123",
                        "type": "function",
                        "function": {
                            "name": "abc_____get_weather",
                            "arguments": "{\"location\": \"Boston\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(Some("test-key".to_string()), Some(mock_server.uri()));
    let response = provider
        .complete(&request(vec![weather_tool()]))
        .await
        .unwrap();

    let choice = &response.choices[0];
    assert!(choice.finish_reason.is_tool_call());
    assert_eq!(choice.message.content, "");
    let call = &choice.message.tool_calls[0];
    assert_eq!(call.id, "call_abc123");
    assert_eq!(call.name, "abc_____get_weather");
    let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
    assert_eq!(args["location"], "Boston");
}

#[tokio::test]
async fn test_openai_stream_reassembles_tool_call() {
    let mock_server = MockServer::start().await;

    let frames = [
        json!({"choices": [{"index": 0, "delta": {"content": "Let me check"}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "id": "tc1", "type": "function",
            "function": {"name": "abc_____get_weather", "arguments": "{\"x\":"}
        }]}}]}),
        json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "function": {"arguments": "1}"}
        }]}}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10}}),
    ];
    let mut body: String = frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n"))
        .collect();
    body.push_str("data: [DONE]\n\n");

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(Some("test-key".to_string()), Some(mock_server.uri()));
    let mut stream = provider
        .complete_stream(&request(vec![weather_tool()]))
        .await
        .unwrap();

    let mut text = String::new();
    let mut assembler = ToolCallAssembler::new();
    let mut finish = None;
    let mut usage = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                text.push_str(&content);
            }
            for delta in &choice.delta.tool_calls {
                assembler.apply(delta);
            }
            if choice.finish_reason.is_some() {
                finish = choice.finish_reason;
            }
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    assert_eq!(text, "Let me check");
    assert_eq!(finish, Some(FinishReason::ToolCalls));
    assert_eq!(usage.unwrap().total_tokens, 10);
    let calls = assembler.finish();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "tc1");
    assert_eq!(calls[0].arguments, "{\"x\":1}");
}

#[tokio::test]
async fn test_openai_error_status_is_agent_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"bad key sk-secret\"}"))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(Some("wrong".to_string()), Some(mock_server.uri()));
    let err = provider.complete(&request(vec![])).await.unwrap_err();
    assert!(matches!(err, Error::Agent(_)));
    assert!(err.to_string().contains("status=401"));
    assert!(!err.public_message().contains("sk-secret"));
}
