//! Completion service adapter.
//!
//! [`CompletionAdapter::complete`] turns one [`Query`] into one
//! [`CompletionResponse`]. It never fails: any problem with the remote side is
//! folded into an error-flagged response whose text is safe to broadcast.
//!
//! The remote call itself sits behind [`CompletionBackend`] so tests (and other
//! providers) can stand in for [`OpenAiBackend`].
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bot::parser::Query;
use crate::config::{BotConfig, LlmConfig};
use crate::errors::ServiceError;
use crate::logutil::escape_log;
use crate::metrics;

/// Default system instruction; `{max_chars}` is replaced with the reply budget.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant responding via Meshtastic radio network.\n\
Your response MUST be under {max_chars} characters. Be concise and helpful.\n\
If the query requires a long answer, provide the most important information first.";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_text: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub text: String,
    pub was_error: bool,
}

impl CompletionResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            was_error: false,
        }
    }

    pub fn error(err: &ServiceError) -> Self {
        Self {
            text: format!("AI Error: {}", err.short_reason()),
            was_error: true,
        }
    }
}

/// Token ceiling derived from a character budget.
///
/// A rough characters-per-token ratio; the prompt asks for the length limit in
/// characters and the token cap only stops runaway completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub chars_per_token: u32,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self { chars_per_token: 2 }
    }
}

impl TokenBudget {
    pub fn max_tokens(&self, max_chars: usize) -> u32 {
        let cpt = self.chars_per_token.max(1) as usize;
        let tokens = (max_chars / cpt).max(1);
        u32::try_from(tokens).unwrap_or(u32::MAX)
    }
}

/// One remote chat exchange: (system, user) in, text out.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn chat(&self, request: &CompletionRequest) -> Result<String, ServiceError>;

    /// Human readable name for logs
    fn describe(&self) -> String {
        "completion backend".to_string()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(cfg: &LlmConfig, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = cfg.request_timeout_seconds {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.api_base.trim_end_matches('/')),
            api_key: api_key.into(),
            model: cfg.model.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn status_to_error(status: reqwest::StatusCode) -> ServiceError {
    match status.as_u16() {
        401 | 403 => ServiceError::Auth,
        429 => ServiceError::Quota,
        code => ServiceError::Http(code),
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn chat(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        let body = ChatRequestBody {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_text,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!("Completion service returned HTTP {}", status);
            return Err(status_to_error(status));
        }

        let parsed: ChatResponseBody = response
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or(ServiceError::Empty)
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.endpoint, self.model)
    }
}

/// Builds requests for queries and interprets the backend's answer.
pub struct CompletionAdapter {
    backend: Arc<dyn CompletionBackend>,
    budget: TokenBudget,
    temperature: f32,
    system_prompt: String,
}

impl CompletionAdapter {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            budget: TokenBudget::default(),
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn from_config(backend: Arc<dyn CompletionBackend>, cfg: &LlmConfig) -> Self {
        Self {
            backend,
            budget: TokenBudget {
                chars_per_token: cfg.chars_per_token,
            },
            temperature: cfg.temperature,
            system_prompt: cfg
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.describe()
    }

    pub fn system_prompt_for(&self, max_chars: usize) -> String {
        self.system_prompt
            .replace("{max_chars}", &max_chars.to_string())
    }

    pub fn build_request(&self, query_text: &str, config: &BotConfig) -> CompletionRequest {
        CompletionRequest {
            system_prompt: self.system_prompt_for(config.max_response_length),
            user_text: query_text.to_string(),
            max_tokens: self.budget.max_tokens(config.max_response_length),
            temperature: self.temperature,
        }
    }

    pub async fn complete(&self, query: &Query, config: &BotConfig) -> CompletionResponse {
        let request = self.build_request(&query.text, config);
        let started = Instant::now();
        let result = self.backend.chat(&request).await;
        metrics::observe_completion_latency(started);

        match result.map(|text| text.trim().to_string()) {
            Ok(text) if !text.is_empty() => {
                debug!(
                    "Completion for {} in {}ms: '{}'",
                    query.source_id,
                    started.elapsed().as_millis(),
                    escape_log(&text)
                );
                CompletionResponse::ok(text)
            }
            Ok(_) => {
                metrics::inc_service_errors();
                warn!("Completion service returned only whitespace");
                CompletionResponse::error(&ServiceError::Empty)
            }
            Err(e) => {
                metrics::inc_service_errors();
                warn!("Completion request failed: {}", e);
                CompletionResponse::error(&e)
            }
        }
    }

    /// Tiny request used to validate the credential when the service is enabled.
    pub async fn probe(&self) -> Result<(), ServiceError> {
        let request = CompletionRequest {
            system_prompt: self.system_prompt_for(crate::config::DEFAULT_MAX_RESPONSE_LENGTH),
            user_text: "Hello".to_string(),
            max_tokens: 10,
            temperature: self.temperature,
        };
        self.backend.chat(&request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Canned {
        reply: Result<String, ServiceError>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionBackend for Canned {
        async fn chat(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    fn canned(reply: Result<String, ServiceError>) -> Arc<Canned> {
        Arc::new(Canned {
            reply,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn query(text: &str) -> Query {
        crate::bot::parser::parse_from("!00000001", &format!("!{}", text), "!").unwrap()
    }

    #[test]
    fn token_budget_divides_and_floors_at_one() {
        let b = TokenBudget::default();
        assert_eq!(b.max_tokens(200), 100);
        assert_eq!(b.max_tokens(1), 1);
        assert_eq!(TokenBudget { chars_per_token: 4 }.max_tokens(10), 2);
        assert_eq!(TokenBudget { chars_per_token: 0 }.max_tokens(10), 10);
    }

    #[tokio::test]
    async fn request_carries_budget_in_prompt_and_tokens() {
        let backend = canned(Ok("  fine  ".to_string()));
        let adapter = CompletionAdapter::new(backend.clone());
        let cfg = BotConfig::new("!", 150).unwrap();
        let resp = adapter.complete(&query("hi"), &cfg).await;
        assert_eq!(resp, CompletionResponse::ok("fine"));

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].system_prompt.contains("under 150 characters"));
        assert_eq!(seen[0].user_text, "hi");
        assert_eq!(seen[0].max_tokens, 75);
        assert!((seen[0].temperature - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn failures_become_error_responses() {
        let cfg = BotConfig::default();
        let adapter = CompletionAdapter::new(canned(Err(ServiceError::Auth)));
        let resp = adapter.complete(&query("hi"), &cfg).await;
        assert!(resp.was_error);
        assert_eq!(resp.text, "AI Error: invalid API key");

        let adapter = CompletionAdapter::new(canned(Ok("   ".to_string())));
        let resp = adapter.complete(&query("hi"), &cfg).await;
        assert!(resp.was_error);
        assert_eq!(resp.text, "AI Error: empty response");
    }

    #[test]
    fn custom_prompt_substitutes_budget() {
        let llm = LlmConfig {
            system_prompt: Some("Reply in {max_chars} chars or less.".to_string()),
            chars_per_token: 3,
            ..LlmConfig::default()
        };
        let adapter = CompletionAdapter::from_config(canned(Ok(String::new())), &llm);
        let req = adapter.build_request("q", &BotConfig::new("!", 90).unwrap());
        assert_eq!(req.system_prompt, "Reply in 90 chars or less.");
        assert_eq!(req.max_tokens, 30);
    }

    #[test]
    fn endpoint_joins_base_without_double_slash() {
        let llm = LlmConfig {
            api_base: "http://127.0.0.1:9/v1/".to_string(),
            ..LlmConfig::default()
        };
        let backend = OpenAiBackend::new(&llm, "k").unwrap();
        assert_eq!(backend.endpoint(), "http://127.0.0.1:9/v1/chat/completions");
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert_eq!(status_to_error(StatusCode::UNAUTHORIZED), ServiceError::Auth);
        assert_eq!(status_to_error(StatusCode::FORBIDDEN), ServiceError::Auth);
        assert_eq!(status_to_error(StatusCode::TOO_MANY_REQUESTS), ServiceError::Quota);
        assert_eq!(
            status_to_error(StatusCode::SERVICE_UNAVAILABLE),
            ServiceError::Http(503)
        );
    }
}
