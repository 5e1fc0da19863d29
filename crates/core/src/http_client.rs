// crates/core/src/http_client.rs

//! Chat-completions client for OpenAI-compatible and Azure endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;

use crate::ai_client::{AiClient, BackendTimeout, ChatRequest, ChatResponse};
use crate::config::{ApiStyle, BackendConfig};

const MAX_ATTEMPTS: u32 = 3;

/// Blocking HTTP client for a chat-completions endpoint.
///
/// Retries 429 and 5xx answers with backoff; transport timeouts surface as
/// [`BackendTimeout`] so the caller can tell them apart from other failures.
pub struct ChatCompletionsClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    api_style: ApiStyle,
    model: String,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        let base = config.endpoint.trim_end_matches('/');
        let url = match config.api_style {
            _ if base.ends_with("/chat/completions") => base.to_string(),
            ApiStyle::OpenAi => format!("{}/v1/chat/completions", base),
            ApiStyle::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version=2024-10-21",
                base, config.model
            ),
        };

        tracing::debug!(url = %url, model = %config.model, "chat backend configured");

        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
            api_style: config.api_style,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

/// Request body for the chat-completions API.
#[derive(Serialize)]
struct CompletionsBody<'a> {
    model: &'a str,
    messages: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
    max_tokens: u32,
}

impl AiClient for ChatCompletionsClient {
    fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = CompletionsBody {
            model: &self.model,
            messages: &request.messages,
            response_format: request.response_format.as_ref(),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
        };

        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut builder = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                builder = match self.api_style {
                    ApiStyle::OpenAi => builder.bearer_auth(key),
                    ApiStyle::Azure => builder.header("api-key", key),
                };
            }

            match builder.send() {
                Ok(r) => {
                    let status = r.status();
                    if !status.is_success() {
                        let text = r.text().unwrap_or_default();

                        if status.as_u16() == 429 || status.is_server_error() {
                            let delay = if status.as_u16() == 429 {
                                2 * u64::from(attempt * attempt)
                            } else {
                                u64::from(attempt)
                            };
                            let preview: String = text.chars().take(300).collect();
                            tracing::warn!(
                                attempt,
                                status = %status,
                                delay_secs = delay,
                                body = %preview,
                                "chat backend busy, retrying"
                            );
                            last_error = Some(anyhow::anyhow!("HTTP {} - {}", status, text));
                            std::thread::sleep(Duration::from_secs(delay));
                            continue;
                        }

                        anyhow::bail!("chat request failed: HTTP {} - {}", status, text);
                    }

                    let parsed: ChatResponse =
                        r.json().context("failed to parse chat completion response")?;
                    if let Some(usage) = parsed.usage {
                        tracing::debug!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "chat usage"
                        );
                    }
                    return Ok(parsed);
                }
                Err(e) if e.is_timeout() => {
                    return Err(anyhow::Error::new(BackendTimeout).context(format!(
                        "no answer from {} within the transport timeout",
                        self.url
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "chat backend network error, retrying");
                    last_error = Some(anyhow::anyhow!("network error: {}", e));
                    std::thread::sleep(Duration::from_secs(u64::from(attempt)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("request failed after retries")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shapes() {
        let mut config = BackendConfig::default();
        config.endpoint = "http://localhost:11434/".into();
        let client = ChatCompletionsClient::new(&config).unwrap();
        assert_eq!(client.url, "http://localhost:11434/v1/chat/completions");

        config.endpoint = "https://res.openai.azure.com".into();
        config.model = "gpt-4o".into();
        config.api_style = ApiStyle::Azure;
        let client = ChatCompletionsClient::new(&config).unwrap();
        assert!(client
            .url
            .starts_with("https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions"));

        config.endpoint = "https://proxy.local/chat/completions".into();
        let client = ChatCompletionsClient::new(&config).unwrap();
        assert_eq!(client.url, "https://proxy.local/chat/completions");
    }
}
