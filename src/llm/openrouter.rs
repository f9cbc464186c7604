//! OpenRouter chat-completions client. Transient failures are retried with
//! backoff inside one `chat_completion` call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{ChatMessage, ChatResponse, LlmClient, TokenUsage, ToolCall, ToolDefinition};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    retry: RetryConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self::with_retry_config(api_key, RetryConfig::default())
    }

    pub fn with_retry_config(api_key: String, retry: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            retry,
        }
    }

    async fn send_once(&self, request: &CompletionRequest<'_>) -> Result<ChatResponse, LlmError> {
        let send = self
            .client
            .post(OPENROUTER_API_URL)
            .bearer_auth(&self.api_key)
            .header("X-Title", "twinspawn")
            .json(request)
            .send();

        let response = match tokio::time::timeout(self.retry.request_timeout, send).await {
            Err(_) => return Err(LlmError::timeout(self.retry.request_timeout)),
            Ok(Err(e)) => return Err(LlmError::network_error(format!("request failed: {}", e))),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(status_error(status, body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::parse_error(format!("{}; body: {}", e, body)))?;
        parsed.into_chat_response()
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        let request = CompletionRequest {
            model,
            messages,
            tool_choice: tools.map(|_| "auto"),
            tools,
        };
        tracing::debug!("OpenRouter request: model={}, messages={}", model, messages.len());

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let error = match self.send_once(&request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!("Gateway recovered after {} retries in {:?}", attempt, started.elapsed());
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let budget = self.retry.max_retry_duration.saturating_sub(started.elapsed());
            let delay = error.suggested_delay(attempt).min(budget);
            if !self.retry.should_retry(&error) || attempt >= self.retry.max_retries || delay.is_zero() {
                tracing::error!("Gateway request failed after {} retries: {}", attempt, error);
                return Err(error.into());
            }

            tracing::warn!("Gateway {} (attempt {}), retrying in {:?}", error.kind, attempt + 1, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> LlmError {
    let code = status.as_u16();
    match classify_http_status(code) {
        LlmErrorKind::RateLimited => LlmError::rate_limited(body, retry_after),
        LlmErrorKind::ClientError => LlmError::client_error(code, body),
        _ => LlmError::server_error(code, body),
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl CompletionResponse {
    fn into_chat_response(self) -> Result<ChatResponse, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("no choices in response".to_string()))?;
        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason: choice.finish_reason,
            usage: self
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StopReason;

    #[test]
    fn tool_call_response_becomes_chat_response() {
        let body = r#"{
            "model": "test/model",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"src/lib.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(body).unwrap();
        let response = parsed.into_chat_response().unwrap();

        assert_eq!(response.stop_reason(), StopReason::ToolUse);
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "read_file");
        assert_eq!(calls[0].arguments()["path"], "src/lib.rs");
        assert_eq!(response.usage, Some(TokenUsage::new(12, 3)));
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let parsed: CompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let error = parsed.into_chat_response().unwrap_err();
        assert_eq!(error.kind, LlmErrorKind::ParseError);
    }

    #[test]
    fn request_omits_tool_fields_without_catalog() {
        let request = CompletionRequest {
            model: "m",
            messages: &[],
            tools: None,
            tool_choice: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tool_choice").is_none());
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        let error = status_error(StatusCode::TOO_MANY_REQUESTS, "slow".into(), Some(Duration::from_secs(9)));
        assert_eq!(error.kind, LlmErrorKind::RateLimited);
        assert_eq!(error.suggested_delay(0), Duration::from_secs(9));

        let error = status_error(StatusCode::UNAUTHORIZED, "bad key".into(), None);
        assert_eq!(error.status_code, Some(401));
    }
}
