mod common;

use std::sync::Arc;

use common::StubHttp;
use meshai::bot::completion::{
    CompletionAdapter, CompletionBackend, CompletionRequest, OpenAiBackend,
};
use meshai::bot::parser::parse_from;
use meshai::config::{BotConfig, LlmConfig};
use meshai::errors::ServiceError;

const OK_BODY: &str = r#"{"id":"x","object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"  LoRa is long range radio.  "},"finish_reason":"stop"}]}"#;

fn llm_for(stub: &StubHttp) -> LlmConfig {
    LlmConfig {
        api_base: stub.base.clone(),
        model: "test-model".to_string(),
        request_timeout_seconds: Some(5),
        ..LlmConfig::default()
    }
}

fn request() -> CompletionRequest {
    CompletionRequest {
        system_prompt: "be brief".to_string(),
        user_text: "what is lora".to_string(),
        max_tokens: 100,
        temperature: 0.7,
    }
}

#[tokio::test]
async fn posts_chat_completion_with_bearer_token() {
    let stub = StubHttp::serve(200, OK_BODY).await;
    let backend = OpenAiBackend::new(&llm_for(&stub), "sk-test").unwrap();

    let text = backend.chat(&request()).await.unwrap();
    assert_eq!(text, "  LoRa is long range radio.  ");

    let heads = stub.request_heads();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("POST /v1/chat/completions "));
    assert!(heads[0]
        .to_ascii_lowercase()
        .contains("authorization: bearer sk-test"));

    let bodies = stub.request_bodies();
    let body = &bodies[0];
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["max_tokens"], 100);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "be brief");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "what is lora");
    let temp = body["temperature"].as_f64().unwrap();
    assert!((temp - 0.7).abs() < 1e-3);
}

#[tokio::test]
async fn http_status_maps_to_service_error() {
    for (status, expected) in [
        (401, ServiceError::Auth),
        (403, ServiceError::Auth),
        (429, ServiceError::Quota),
        (500, ServiceError::Http(500)),
    ] {
        let stub = StubHttp::serve(status, r#"{"error":{"message":"nope"}}"#).await;
        let backend = OpenAiBackend::new(&llm_for(&stub), "k").unwrap();
        assert_eq!(backend.chat(&request()).await, Err(expected), "status {}", status);
    }
}

#[tokio::test]
async fn bad_bodies_are_malformed_or_empty() {
    let stub = StubHttp::serve(200, "this is not json").await;
    let backend = OpenAiBackend::new(&llm_for(&stub), "k").unwrap();
    assert!(matches!(
        backend.chat(&request()).await,
        Err(ServiceError::Malformed(_))
    ));

    let stub = StubHttp::serve(200, r#"{"choices":[]}"#).await;
    let backend = OpenAiBackend::new(&llm_for(&stub), "k").unwrap();
    assert_eq!(backend.chat(&request()).await, Err(ServiceError::Empty));
}

#[tokio::test]
async fn unreachable_service_is_network_error() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let llm = LlmConfig {
        api_base: format!("http://127.0.0.1:{}/v1", port),
        request_timeout_seconds: Some(2),
        ..LlmConfig::default()
    };
    let backend = OpenAiBackend::new(&llm, "k").unwrap();
    assert!(matches!(
        backend.chat(&request()).await,
        Err(ServiceError::Network(_))
    ));
}

#[tokio::test]
async fn adapter_over_http_trims_and_budgets() {
    let stub = StubHttp::serve(200, OK_BODY).await;
    let llm = llm_for(&stub);
    let backend = OpenAiBackend::new(&llm, "k").unwrap();
    let adapter = CompletionAdapter::from_config(Arc::new(backend), &llm);

    assert!(adapter.probe().await.is_ok());
    let query = parse_from("!0000eeee", "!what is lora", "!").unwrap();
    let resp = adapter
        .complete(&query, &BotConfig::new("!", 120).unwrap())
        .await;
    assert!(!resp.was_error);
    assert_eq!(resp.text, "LoRa is long range radio.");

    let bodies = stub.request_bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["max_tokens"], 10);
    assert_eq!(bodies[0]["messages"][1]["content"], "Hello");
    assert_eq!(bodies[1]["max_tokens"], 60);
    assert!(bodies[1]["messages"][0]["content"]
        .as_str()
        .unwrap()
        .contains("under 120 characters"));
}

#[tokio::test]
async fn adapter_reports_auth_failure_as_text() {
    let stub = StubHttp::serve(401, "{}").await;
    let llm = llm_for(&stub);
    let adapter = CompletionAdapter::from_config(
        Arc::new(OpenAiBackend::new(&llm, "bad").unwrap()),
        &llm,
    );
    let query = parse_from("!0000eeee", "!hi", "!").unwrap();
    let resp = adapter.complete(&query, &BotConfig::default()).await;
    assert!(resp.was_error);
    assert_eq!(resp.text, "AI Error: invalid API key");
    assert_eq!(adapter.probe().await, Err(ServiceError::Auth));
}
