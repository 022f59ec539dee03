//! OpenAI-compatible `/chat/completions` client (OpenRouter by default).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use synapse_storage::{retry_after, BackoffPolicy, HttpClientConfig, RetryDisposition};
use tracing::{debug, warn};

use crate::{ChatBackend, ChatRequest, ChatResponse, LlmError, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty("LLM_API_KEY").or_else(|| non_empty("OPENROUTER_API_KEY")),
            base_url: non_empty("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout_secs: non_empty("LLM_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        }
    }
}

pub struct OpenAiCompatClient {
    http: Client,
    endpoint: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageBody {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        http_config: &HttpClientConfig,
    ) -> Result<Self, LlmError> {
        let http = http_config
            .build_client()
            .map_err(|err| LlmError::Configuration(format!("{err:#}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            backoff: http_config.backoff,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            LlmError::Configuration("LLM_API_KEY or OPENROUTER_API_KEY is not set".to_string())
        })?;
        Self::new(&config.base_url, api_key, &config.http_config())
    }

    fn decode(request: &ChatRequest, body: CompletionBody) -> Result<ChatResponse, LlmError> {
        let content = body
            .choices
            .into_iter()
            .find_map(|choice| choice.message.and_then(|m| m.content))
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::EmptyResponse {
                model: request.model.clone(),
            })?;
        let usage = body.usage.unwrap_or_default();
        Ok(ChatResponse {
            model: body.model.unwrap_or_else(|| request.model.clone()),
            content,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
            },
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let model = request.model.as_str();
        for attempt in 0..=self.backoff.max_retries {
            debug!(model, attempt, "sending chat completion");
            let sent = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(request)
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => {
                    let body: CompletionBody =
                        resp.json().await.map_err(|err| LlmError::Decode {
                            model: model.to_string(),
                            detail: err.to_string(),
                        })?;
                    return Self::decode(request, body);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let hint = retry_after(resp.headers());
                    if let Some(wait) =
                        self.backoff
                            .next_delay(RetryDisposition::for_status(status), attempt, hint)
                    {
                        warn!(model, %status, attempt, ?wait, "retrying chat completion");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(LlmError::Status {
                        model: model.to_string(),
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if let Some(wait) =
                        self.backoff
                            .next_delay(RetryDisposition::for_error(&err), attempt, None)
                    {
                        warn!(model, error = %err, attempt, ?wait, "retrying chat completion");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(LlmError::Request {
                        model: model.to_string(),
                        source: err,
                    });
                }
            }
        }
        unreachable!("final attempt always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "acme/writer-1".into(),
            messages: vec![ChatMessage::user("Write about dentists.")],
            temperature: Some(0.2),
            max_tokens: None,
        }
    }

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "model": "acme/writer-1",
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        })
    }

    #[tokio::test]
    async fn posts_chat_completion_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(bearer_token("sk-test"))
            .and(body_partial_json(json!({"model": "acme/writer-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Dentists fix teeth.")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(
            &format!("{}/api/v1/", server.uri()),
            "sk-test",
            &fast_config(),
        )
        .expect("client");
        let response = client.complete(&request()).await.expect("response");
        assert_eq!(response.content, "Dentists fix teeth.");
        assert_eq!(response.usage.total(), 42);
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(&server.uri(), "sk-test", &fast_config())
            .expect("client");
        let response = client.complete(&request()).await.expect("response");
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(&server.uri(), "sk-test", &fast_config())
            .expect("client");
        let err = client.complete(&request()).await.expect_err("unauthorized");
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn empty_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new(&server.uri(), "sk-test", &fast_config())
            .expect("client");
        assert!(matches!(
            client.complete(&request()).await,
            Err(LlmError::EmptyResponse { .. })
        ));
    }

    #[test]
    fn config_falls_back_to_openrouter_key_and_redacts_it() {
        let config = LlmConfig::from_lookup(|key| match key {
            "OPENROUTER_API_KEY" => Some("sk-router".into()),
            "LLM_TIMEOUT_SECS" => Some("15".into()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("sk-router"));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.timeout_secs, 15);
        assert!(!format!("{config:?}").contains("sk-router"));

        let missing = LlmConfig::from_lookup(|_| None);
        assert!(matches!(
            OpenAiCompatClient::from_config(&missing),
            Err(LlmError::Configuration(_))
        ));
    }
}
