use std::sync::Arc;
use std::time::Duration;

use compliance_research::gateway::completions::ChatProvider;
use compliance_research::gateway::{
    Attribution, ChatCompletionsAdapter, ChatRequest, FinishReason, GatewayConfig, Message,
    ProviderError, ProviderGateway, RecordingUsageSink, ToolSpec,
};
use compliance_research::gateway::usage::CallStatus;
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> ChatCompletionsAdapter {
    ChatCompletionsAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "test-model",
        vec![Message::system("be brief"), Message::user("hi")],
        Attribution::new("test").with_session("s1").with_turn("t1"),
    )
}

#[tokio::test]
async fn parses_content_usage_and_finish_reason() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert!(resp.tool_calls.is_empty());
}

#[tokio::test]
async fn sends_tools_and_parses_tool_calls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "tool_choice": "auto",
            "tools": [{"type": "function", "function": {"name": "provide_a_list"}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "provide_a_list",
                            "arguments": "{\"query\":\"honey export certifications\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let tool = ToolSpec::function(
        "provide_a_list",
        "List things",
        json!({"type": "object", "properties": {"query": {"type": "string"}}}),
    );
    let req = request().tools(vec![tool]);
    let resp = adapter(&server).chat(&req).await.unwrap();

    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    assert_eq!(resp.content, "");
    assert_eq!(resp.tool_calls.len(), 1);
    assert_eq!(resp.tool_calls[0].name, "provide_a_list");
    let args: serde_json::Value = resp.tool_calls[0].parse_arguments().unwrap();
    assert_eq!(args["query"], "honey export certifications");
}

#[tokio::test]
async fn maps_status_codes_to_typed_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "limited"})))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-429")
                .set_body_json(json!({"error": {"message": "slow down", "code": "rate_limit"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "broken"})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "bad tools"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "down"})))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let adapter = adapter(&server);
    let mk = |model: &str| ChatRequest::new(model, vec![Message::user("hi")], Attribution::new("test"));

    let err = adapter.chat(&mk("limited")).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert_eq!(err.code(), "rate_limited");
    assert_eq!(err.request_id(), Some("req-429"));

    let err = adapter.chat(&mk("broken")).await.unwrap_err();
    match err {
        ProviderError::InvalidRequest { message, .. } => assert_eq!(message, "bad tools"),
        other => panic!("expected invalid request, got {other:?}"),
    }

    let err = adapter.chat(&mk("down")).await.unwrap_err();
    assert_eq!(err.code(), "provider_error");
}

#[tokio::test]
async fn streams_content_deltas_until_done() {
    let server = MockServer::start().await;

    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let stream = adapter(&server).chat_stream(&request()).await.unwrap();
    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks.concat(), "Hello world");
    assert!(chunks.iter().all(|c| !c.is_empty()));
}

#[tokio::test]
async fn gateway_records_one_usage_entry_per_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "ok"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "fine"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "bad"})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let sink = Arc::new(RecordingUsageSink::new());
    let gateway =
        ProviderGateway::with_config(adapter(&server), Arc::clone(&sink), GatewayConfig::default());

    let attribution = Attribution::new("research::classify")
        .with_session("s1")
        .with_turn("t1");
    let ok = ChatRequest::new("ok", vec![Message::user("hi")], attribution.clone());
    let bad = ChatRequest::new("bad", vec![Message::user("hi")], attribution);

    assert_eq!(gateway.chat(ok).await.unwrap().content, "fine");
    assert!(gateway.chat(bad).await.is_err());

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, CallStatus::Success);
    assert_eq!((records[0].input_tokens, records[0].output_tokens), (3, 4));
    assert_eq!(records[0].caller, "research::classify");
    assert_eq!(records[0].session_id.as_deref(), Some("s1"));
    assert_eq!(records[0].turn_id.as_deref(), Some("t1"));
    assert_eq!(records[1].status, CallStatus::Error);
    assert_eq!(records[1].error_code.as_deref(), Some("provider_error"));
}
