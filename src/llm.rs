//! Chat LLM client for an OpenAI-compatible `/v1/chat/completions` endpoint.
//!
//! One bounded-timeout request per call; streaming is not used because the
//! composer appends the full assistant message to the session atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    /// Total tokens as reported by the provider, when available.
    pub tokens_used: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> AppResult<ChatCompletion>;
}

pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

impl HttpChatClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.llm_request_timeout)
            .build()
            .map_err(|e| AppError::ConfigInvalid(format!("chat client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for HttpChatClient {
    async fn complete(&self, system: &str, user: &str) -> AppResult<ChatCompletion> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatRequestMessage {
                    role: "system",
                    content: system,
                },
                ChatRequestMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::from_transport("chat LLM", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                429 => AppError::RateLimited("chat LLM".into()),
                408 | 500..=599 => AppError::UpstreamUnavailable(format!("chat LLM ({status})")),
                _ => AppError::Internal(format!("chat LLM returned {status}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("chat response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Internal("chat LLM returned no choices".into()))?;

        Ok(ChatCompletion {
            content,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_completion_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "See src/auth.rs" } }],
                "usage": { "prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120 }
            })))
            .mount(&server)
            .await;

        let mut config = crate::config::test_config();
        config.llm_base_url = server.uri();
        let client = HttpChatClient::new(&config).unwrap();
        let completion = client.complete("system", "where is auth?").await.unwrap();
        assert_eq!(completion.content, "See src/auth.rs");
        assert_eq!(completion.tokens_used, Some(120));
    }

    #[tokio::test]
    async fn maps_server_errors_to_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let mut config = crate::config::test_config();
        config.llm_base_url = server.uri();
        let client = HttpChatClient::new(&config).unwrap();
        let err = client.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }
}
