use mockito::Matcher;
use serde_json::json;

use unify_llm::engine::ALL_ATTEMPTS_FAILED;
use unify_llm::types::GenerationRequest;
use unify_llm::{
    CacheConfig, AppConfig, GenerateOptions, Generator, InferenceConfig, InstancePool, ModelConfig,
};

fn app(model: ModelConfig, inference: InferenceConfig) -> AppConfig {
    AppConfig {
        model_config: model,
        inference_config: inference,
        cache_config: None,
    }
}

fn quick() -> InferenceConfig {
    InferenceConfig::default()
        .with_max_retry(2)
        .with_sleep_seconds(0.0)
        .with_param("temperature", json!(0.2))
}

#[tokio::test]
async fn test_openai_compatible_roundtrip() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "2+2?"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "choices": [{"message": {"role": "assistant", "content": "4"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let config = app(
        ModelConfig::new("api", "gpt-4o-mini")
            .with_sdk_type("openai")
            .with_api_key("sk-test")
            .with_base_url(server.url()),
        quick(),
    );
    let pool = InstancePool::default();
    let generator = Generator::from_config(&pool, &config).await.unwrap();

    let request = GenerationRequest::from_prompt("2+2?", "be terse");
    let result = generator
        .generate_one(&request, GenerateOptions::new())
        .await
        .unwrap()
        .remove(0);

    mock.assert_async().await;
    assert_eq!(result.response, "4");
    assert_eq!(result.engine, "api");
    assert_eq!(result.input, request);
    assert_eq!(result.metadata["raw_output"]["choices"][0]["finish_reason"], "stop");
    assert!(result.metadata["model_config"].get("api_key").is_none());
    assert_eq!(result.metadata["inference_config"], json!({"temperature": 0.2}));
}

#[tokio::test]
async fn test_prefilled_request_is_sent_merged() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "messages": [{"role": "user", "content": "List primes: 2, 3,"}]
        })))
        .with_status(200)
        .with_body(json!({"choices": [{"message": {"content": " 5, 7"}}]}).to_string())
        .create_async()
        .await;

    let config = app(
        ModelConfig::new("api", "local-model")
            .with_sdk_type("openai")
            .with_base_url(server.url()),
        quick(),
    );
    let generator = Generator::from_config(&InstancePool::default(), &config).await.unwrap();

    let request = GenerationRequest::from_prompt("List primes: ", "").with_prefill("2, 3,");
    let result = generator
        .generate_one(&request, GenerateOptions::new())
        .await
        .unwrap()
        .remove(0);

    mock.assert_async().await;
    assert_eq!(result.response, " 5, 7");
    assert!(result.input.prefilled);
}

#[tokio::test]
async fn test_anthropic_roundtrip_with_key_from_env() {
    std::env::set_var("UNIFY_LLM_TEST_ANTHROPIC_KEY", "ak-env");
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/messages")
        .match_header("x-api-key", "ak-env")
        .match_header("anthropic-version", "2023-06-01")
        .match_body(Matcher::PartialJson(json!({
            "model": "claude-3-5-haiku",
            "system": "be terse",
            "max_tokens": 4096
        })))
        .with_status(200)
        .with_body(
            json!({
                "content": [{"type": "text", "text": "Hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 1}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let config = app(
        ModelConfig::new("api", "claude-3-5-haiku")
            .with_sdk_type("anthropic")
            .with_api_key_name("UNIFY_LLM_TEST_ANTHROPIC_KEY")
            .with_base_url(server.url()),
        InferenceConfig::default().with_sleep_seconds(0.0),
    );
    let generator = Generator::from_config(&InstancePool::default(), &config).await.unwrap();
    let result = generator
        .generate_one(&GenerationRequest::from_prompt("hi", "be terse"), GenerateOptions::new())
        .await
        .unwrap()
        .remove(0);

    mock.assert_async().await;
    assert_eq!(result.response, "Hello");
}

#[tokio::test]
async fn test_gemini_roundtrip() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/models/gemini-1.5-flash:generateContent")
        .match_query(Matcher::UrlEncoded("key".into(), "g-key".into()))
        .match_body(Matcher::PartialJson(json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"temperature": 0.2}
        })))
        .with_status(200)
        .with_body(
            json!({
                "candidates": [{
                    "content": {"parts": [{"text": "Hi"}, {"text": "!"}], "role": "model"},
                    "finishReason": "STOP"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let config = app(
        ModelConfig::new("api", "gemini-1.5-flash")
            .with_sdk_type("gemini")
            .with_api_key("g-key")
            .with_base_url(server.url()),
        quick(),
    );
    let generator = Generator::from_config(&InstancePool::default(), &config).await.unwrap();
    let result = generator
        .generate_one(&GenerationRequest::from_prompt("hi", ""), GenerateOptions::new())
        .await
        .unwrap()
        .remove(0);

    mock.assert_async().await;
    assert_eq!(result.response, "Hi!");
}

#[tokio::test]
async fn test_server_errors_are_retried_then_reported() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("overloaded")
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = app(
        ModelConfig::new("api", "gpt-4o")
            .with_sdk_type("openai")
            .with_base_url(server.url()),
        quick(),
    );
    config.cache_config = Some(CacheConfig::json_file(dir.path()).with_flush_threshold(1));

    let generator = Generator::from_config(&InstancePool::default(), &config).await.unwrap();
    let result = generator
        .generate_one(&GenerationRequest::from_prompt("hi", ""), GenerateOptions::new())
        .await
        .unwrap()
        .remove(0);

    mock.assert_async().await;
    assert_eq!(result.response, "");
    assert_eq!(result.error_message(), Some(ALL_ATTEMPTS_FAILED));
    // failures never reach the store
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_sdk_type_fails_at_resolution() {
    let config = app(ModelConfig::new("api", "gpt-4o"), InferenceConfig::default());
    let err = Generator::from_config(&InstancePool::default(), &config)
        .await
        .err()
        .unwrap();
    assert!(err.is_configuration());
}
