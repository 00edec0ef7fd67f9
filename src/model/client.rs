//! HTTP client for OpenAI-compatible Chat Completions endpoints.
//!
//! Works with any provider exposing `/chat/completions` (OpenAI, Ollama,
//! LM Studio, vLLM). Retries transient failures with exponential backoff and
//! strips `<think>…</think>` reasoning blocks from the returned text.

use super::{Completion, CompletionRequest, LanguageModel, TokenUsage};
use crate::config::ModelSettings;
use crate::ledger::estimate_tokens;
use crate::{LedgerError, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 200;
/// Transport-level ceiling; callers layer their own, usually tighter, timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── Chat Completions API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Parsed LLM response with thinking and final answer separated
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    /// Thinking/reasoning content (from <think> tags)
    pub thinking: Option<String>,
    /// Final response content (after </think>)
    pub response: String,
}

/// Chat Completions client
pub struct ChatClient {
    client: Client,
    settings: ModelSettings,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(settings: ModelSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("storyledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::Config(format!("failed to build HTTP client: {e}")))?;

        let api_key = settings
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        info!(
            "Chat client: model={}, base_url={}, auth={}",
            settings.model,
            settings.base_url,
            if api_key.is_some() { "bearer" } else { "none" }
        );

        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    /// Parse <think>...</think> tags from LLM response, separating thinking from response
    pub fn parse_think_tags(content: &str) -> ParsedResponse {
        static THINK_RE: OnceLock<Regex> = OnceLock::new();
        let re = THINK_RE.get_or_init(|| {
            Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex is valid")
        });

        if let Some(caps) = re.captures(content) {
            let thinking = caps.get(1).map(|m| m.as_str().trim().to_string());
            let response = re.replace_all(content, "").trim().to_string();
            ParsedResponse { thinking, response }
        } else if content.starts_with("<think>") {
            let thinking = content.trim_start_matches("<think>").trim().to_string();
            ParsedResponse {
                thinking: Some(thinking),
                response: String::new(),
            }
        } else {
            ParsedResponse {
                thinking: None,
                response: content.trim().to_string(),
            }
        }
    }

    /// Exponential backoff with a small deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    }

    fn is_retryable_error(msg: &str) -> bool {
        msg.contains("timeout")
            || msg.contains("network")
            || msg.contains("retryable")
            || msg.contains("error sending request")
            || msg.contains("connection")
    }

    async fn send_chat_completions_request(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let mut messages = Vec::new();
        if let Some(sys) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: sys.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let body = ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.settings.max_tokens),
            temperature: self.settings.temperature,
            stream: false,
            response_format: request
                .json
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let response = Self::check_response_status(response).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Model(e.to_string()))?;

        let text = chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = match chat_response.usage {
            Some(u) => TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            },
            None => TokenUsage {
                input_tokens: estimate_tokens(&request.prompt) as u64,
                output_tokens: estimate_tokens(&text) as u64,
            },
        };

        Ok(Completion { text, usage })
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = Self::extract_error_detail(&body);
        let detail = Self::truncate_error_detail(&detail, 500);
        let prefix = if Self::is_retryable_status(status) {
            "retryable API error"
        } else {
            "API error"
        };
        if detail.is_empty() {
            Err(LedgerError::Model(format!("{prefix} {status}")))
        } else {
            Err(LedgerError::Model(format!("{prefix} {status}: {detail}")))
        }
    }

    fn extract_error_detail(body: &str) -> String {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return String::new();
        }

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(msg) = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
            {
                return msg.to_string();
            }
            if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
                return msg.to_string();
            }
            if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
                return msg.to_string();
            }
        }

        trimmed.to_string()
    }

    fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
        if detail.chars().count() <= max_chars {
            return detail.to_string();
        }

        let mut truncated = detail.chars().take(max_chars).collect::<String>();
        truncated.push_str("... [truncated]");
        truncated
    }

    fn map_reqwest_error(e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Model(format!("timeout: {e}"))
        } else if e.is_connect() {
            LedgerError::Model(format!("network: {e}"))
        } else {
            LedgerError::Model(e.to_string())
        }
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    fn name(&self) -> &str {
        &self.settings.model
    }

    /// Call the endpoint with retries (max 4 attempts, exponential backoff).
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                let delay = Self::retry_backoff(attempt);
                warn!(
                    "LLM request failed (attempt {}/{}), retrying in {:?}...",
                    attempt, MAX_RETRY_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_chat_completions_request(request).await {
                Ok(mut completion) => {
                    let parsed = Self::parse_think_tags(&completion.text);
                    if let Some(thinking) = &parsed.thinking {
                        debug!("LLM thinking: {}", thinking);
                    }
                    completion.text = parsed.response;
                    return Ok(completion);
                }
                Err(e) => {
                    let msg = e.to_string();
                    if Self::is_retryable_error(&msg) && attempt + 1 < MAX_RETRY_ATTEMPTS {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| LedgerError::Model("all retry attempts exhausted".to_string())))
    }
}
