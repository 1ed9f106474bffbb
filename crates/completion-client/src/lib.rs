//! Client for OpenAI-compatible chat completion backends.

mod client;
mod error;
mod types;

pub use client::CompletionClient;
pub use error::CompletionError;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_client(mock_server: &MockServer) -> CompletionClient {
        CompletionClient::new(
            "test-api-key",
            mock_server.uri(),
            "test-model",
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_success() {
        let mock_server = MockServer::start().await;

        let response_body = serde_json::json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "test-model-2024",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I help you?"
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 15,
                "total_tokens": 25
            }
        });

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(body_partial_json(serde_json::json!({"model": "test-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(&response_body))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let messages = vec![Message::system("Be brief"), Message::user("Hello")];

        let completion = client.complete(messages, Some(0.7), Some(64)).await.unwrap();
        assert_eq!(completion.text, "Hello! How can I help you?");
        assert_eq!(completion.model, "test-model-2024");

        let usage = completion.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 15);
    }

    #[tokio::test]
    async fn test_complete_without_usage_report() {
        let mock_server = MockServer::start().await;

        let response_body = serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": "ok"},
                "finish_reason": "stop"
            }]
        });

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&response_body))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let completion = client
            .complete(vec![Message::user("Hello")], None, None)
            .await
            .unwrap();

        assert!(completion.usage.is_none());
        assert_eq!(completion.model, "test-model");
    }

    #[tokio::test]
    async fn test_complete_empty_response() {
        let mock_server = MockServer::start().await;

        let response_body = serde_json::json!({
            "id": "chatcmpl-123",
            "model": "test-model",
            "choices": [],
            "usage": null
        });

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&response_body))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.complete(vec![Message::user("Hello")], None, None).await;
        assert!(matches!(result, Err(CompletionError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_complete_rate_limit() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.complete(vec![Message::user("Hello")], None, None).await;
        assert!(matches!(result, Err(CompletionError::RateLimit)));
    }

    #[tokio::test]
    async fn test_complete_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.complete(vec![Message::user("Hello")], None, None).await;
        assert!(matches!(result, Err(CompletionError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_complete_server_error_keeps_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let err = client
            .complete(vec![Message::user("Hello")], None, None)
            .await
            .unwrap_err();

        match err {
            CompletionError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "upstream overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_complete_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let client = CompletionClient::new(
            "key",
            mock_server.uri(),
            "m",
            Duration::from_millis(100),
        )
        .unwrap();
        let result = client.complete(vec![Message::user("Hello")], None, None).await;
        assert!(matches!(result, Err(CompletionError::Timeout)));
    }

    #[tokio::test]
    async fn test_complete_malformed_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.complete(vec![Message::user("Hello")], None, None).await;
        assert!(matches!(result, Err(CompletionError::Decode(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = CompletionClient::new(
            "key",
            "https://api.example.com/v1/",
            "m",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base_url(), "https://api.example.com/v1");
        assert_eq!(client.model(), "m");
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client = CompletionClient::new(
            "super-secret",
            "https://api.example.com",
            "m",
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(!format!("{client:?}").contains("super-secret"));
    }

    #[test]
    fn test_message_constructors() {
        let system = Message::system("You are a helpful assistant");
        assert_eq!(system.role, Role::System);
        assert_eq!(system.content, "You are a helpful assistant");

        let user = Message::user("Hello");
        assert_eq!(user.role, Role::User);
    }
}
