//! Mock-based tests for the OpenAI-compatible provider.
//!
//! These tests use wiremock to simulate upstream responses
//! without making real HTTP requests.

use assert_matches::assert_matches;
use llm_gateway::{
    core::{config::ProviderConfig, AppError},
    services::{ConnectionPool, GenerationParams, GenerationRequest, LlmProvider, OpenAiProvider},
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn provider_config(mock_server: &MockServer, native_batch: bool) -> ProviderConfig {
    ProviderConfig {
        name: "openai".to_string(),
        provider_type: "openai".to_string(),
        api_base: mock_server.uri(),
        api_key: "test-key".to_string(),
        pool_size: 1,
        max_concurrent_per_handle: 2,
        native_batch,
        models: vec!["gpt-4o-mini".to_string()],
    }
}

fn setup(mock_server: &MockServer, native_batch: bool) -> (OpenAiProvider, ConnectionPool) {
    let config = provider_config(mock_server, native_batch);
    let pool = ConnectionPool::new(&config, Duration::from_secs(5), true).unwrap();
    (OpenAiProvider::new(&config), pool)
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest::new("openai", "gpt-4o-mini", prompt)
}

fn chat_response(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    })
}

#[tokio::test]
async fn test_chat_completion_success() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Say hi"}],
            "max_tokens": 5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("hi!")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let req = request("Say hi").with_params(GenerationParams {
        max_tokens: Some(5),
        ..Default::default()
    });

    let completion = provider.complete(&handle, &req).await.unwrap();
    handle.release(true);

    assert_eq!(completion.id, "chatcmpl-123");
    assert_eq!(completion.text, "hi!");
    assert_eq!(completion.usage.input_tokens, 9);
    assert_eq!(completion.usage.output_tokens, 3);
    let phases = completion.phases.unwrap();
    assert!(phases.time_to_first_token.unwrap() <= phases.total);
    assert!(phases.time_per_token.is_some());
}

#[tokio::test]
async fn test_structured_request_sends_response_format() {
    let mock_server = MockServer::start().await;
    let schema = json!({"title": "person", "type": "object", "required": ["name"]});

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": "person", "schema": schema}
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(r#"{"name":"Ada"}"#)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let completion = provider
        .complete_structured(&handle, &request("Who?"), &schema)
        .await
        .unwrap();

    assert_eq!(completion.text, r#"{"name":"Ada"}"#);
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
        )
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = provider.complete(&handle, &request("hi")).await.unwrap_err();

    assert_matches!(
        err,
        AppError::RateLimited { message, retry_after: Some(after) } => {
            assert!(message.contains("Rate limit reached"));
            assert_eq!(after, Duration::from_secs(7));
        }
    );
}

#[tokio::test]
async fn test_server_error_maps_to_provider_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = provider.complete(&handle, &request("hi")).await.unwrap_err();

    assert_matches!(err, AppError::ProviderError { status: Some(503), .. });
    assert!(err.category().is_retryable());
}

#[tokio::test]
async fn test_client_error_maps_to_invalid_request() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"message": "max_tokens is too large"}})),
        )
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = provider.complete(&handle, &request("hi")).await.unwrap_err();

    assert_matches!(err, AppError::InvalidRequest(message) if message.contains("max_tokens is too large"));
}

#[tokio::test]
async fn test_unsupported_model_never_reaches_upstream() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("x")))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, false);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = provider
        .complete(&handle, &GenerationRequest::new("openai", "unknown-model", "hi"))
        .await
        .unwrap_err();

    assert_matches!(err, AppError::InvalidRequest(_));
}

#[tokio::test]
async fn test_native_batch_uses_array_prompt() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completions"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "prompt": ["one", "two", "three"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-batch",
            "choices": [
                {"index": 2, "text": "THREE"},
                {"index": 0, "text": "ONE"},
                {"index": 1, "text": "TWO"}
            ],
            "usage": {"prompt_tokens": 10, "completion_tokens": 7}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, true);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let results = provider
        .complete_batch(&handle, &[request("one"), request("two"), request("three")])
        .await
        .unwrap();

    let texts: Vec<String> = results
        .iter()
        .map(|r| r.as_ref().unwrap().text.clone())
        .collect();
    assert_eq!(texts, vec!["ONE", "TWO", "THREE"]);

    let input: u64 = results.iter().map(|r| r.as_ref().unwrap().usage.input_tokens).sum();
    let output: u64 = results.iter().map(|r| r.as_ref().unwrap().usage.output_tokens).sum();
    assert_eq!((input, output), (10, 7));
}

#[tokio::test]
async fn test_mixed_params_fall_back_to_individual_calls() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("ok")))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (provider, pool) = setup(&mock_server, true);
    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let hot = request("a").with_params(GenerationParams {
        temperature: Some(1.0),
        ..Default::default()
    });

    let results = provider
        .complete_batch(&handle, &[request("b"), hot])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_connection_refused_is_transport_failure() {
    let config = ProviderConfig {
        name: "openai".to_string(),
        provider_type: "openai".to_string(),
        // Port 9 (discard) is not listening in test environments
        api_base: "http://127.0.0.1:9".to_string(),
        api_key: "test-key".to_string(),
        pool_size: 1,
        max_concurrent_per_handle: 1,
        native_batch: false,
        models: vec![],
    };
    let pool = ConnectionPool::new(&config, Duration::from_secs(2), true).unwrap();
    let provider = OpenAiProvider::new(&config);

    let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = provider.complete(&handle, &request("hi")).await.unwrap_err();

    assert!(err.is_transport_failure());
}
