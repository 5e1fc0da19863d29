// crates/core/src/ai_client.rs

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::OrchestratorError;

/// Abstract AI/LLM client for chat completions.
///
/// Implementations can use an OpenAI-compatible HTTP endpoint, a local
/// model server, or a scripted responder in tests.
pub trait AiClient: Send + Sync {
    fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}

/// A chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Value>,
    /// Ask the backend for a JSON object reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            response_format: None,
            max_tokens: None,
        }
    }

    /// System + user prompt pair.
    pub fn prompt(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(vec![
            json!({ "role": "system", "content": system.into() }),
            json!({ "role": "user", "content": user.into() }),
        ])
    }

    pub fn json_object(mut self) -> Self {
        self.response_format = Some(json!({ "type": "json_object" }));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated content of every message, handy for matching in tests.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A chat completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Build a single-choice response, mostly for scripted backends.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(text.into()),
                },
            }],
            usage: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Token counters reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn accumulate(&mut self, other: Option<TokenUsage>) {
        if let Some(other) = other {
            self.prompt_tokens += other.prompt_tokens;
            self.completion_tokens += other.completion_tokens;
        }
    }
}

/// Error a client returns when its own transport gave up waiting.
#[derive(Debug)]
pub struct BackendTimeout;

impl fmt::Display for BackendTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("backend did not answer in time")
    }
}

impl std::error::Error for BackendTimeout {}

/// Run one chat call with a hard deadline.
///
/// The call runs on a worker thread; when the deadline passes the caller gets
/// a `Timeout` and the worker's late answer is discarded.
pub fn chat_with_deadline(
    client: &Arc<dyn AiClient>,
    request: ChatRequest,
    timeout: Duration,
    operation: &str,
) -> Result<ChatResponse, OrchestratorError> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(client);

    std::thread::Builder::new()
        .name(format!("llm-{}", operation))
        .spawn(move || {
            let _ = tx.send(worker.chat(request));
        })
        .map_err(|e| OrchestratorError::backend(operation, e))?;

    let timed_out = || OrchestratorError::Timeout {
        operation: operation.to_string(),
        after: timeout,
    };

    match rx.recv_timeout(timeout) {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) if e.downcast_ref::<BackendTimeout>().is_some() => Err(timed_out()),
        Ok(Err(e)) => Err(OrchestratorError::backend(operation, format!("{:#}", e))),
        Err(RecvTimeoutError::Timeout) => Err(timed_out()),
        Err(RecvTimeoutError::Disconnected) => Err(OrchestratorError::backend(
            operation,
            "worker exited without an answer",
        )),
    }
}

type Responder = dyn Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync;

/// In-process client driven by a closure.
///
/// Every request is recorded so callers can inspect the prompts that were
/// sent.
pub struct ScriptedClient {
    responder: Box<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply with the next text of `replies` on each call, repeating the last.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies.into_iter().map(Into::into).collect();
        let cursor = Mutex::new(0usize);
        Self::new(move |_| {
            let mut idx = cursor.lock().unwrap_or_else(PoisonError::into_inner);
            let text = replies
                .get(*idx)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_default();
            *idx += 1;
            Ok(ChatResponse::from_text(text))
        })
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl AiClient for ScriptedClient {
    fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        (self.responder)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_deadline_returns_answer() {
        let client: Arc<dyn AiClient> = Arc::new(ScriptedClient::replies(["hello"]));
        let resp = chat_with_deadline(
            &client,
            ChatRequest::prompt("sys", "hi"),
            Duration::from_secs(2),
            "test",
        )
        .unwrap();
        assert_eq!(resp.text(), Some("hello"));
    }

    #[test]
    fn test_deadline_expires_on_slow_backend() {
        let client: Arc<dyn AiClient> = Arc::new(ScriptedClient::new(|_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(ChatResponse::from_text("late"))
        }));
        let err = chat_with_deadline(
            &client,
            ChatRequest::prompt("sys", "hi"),
            Duration::from_millis(50),
            "slow",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
    }

    #[test]
    fn test_transport_timeout_maps_to_timeout() {
        let client: Arc<dyn AiClient> =
            Arc::new(ScriptedClient::new(|_| Err(anyhow::Error::new(BackendTimeout))));
        let err = chat_with_deadline(&client, ChatRequest::prompt("s", "u"), Duration::from_secs(1), "t")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
    }

    #[test]
    fn test_backend_errors_are_wrapped() {
        let client: Arc<dyn AiClient> =
            Arc::new(ScriptedClient::new(|_| anyhow::bail!("HTTP 503 - overloaded")));
        let err = chat_with_deadline(&client, ChatRequest::prompt("s", "u"), Duration::from_secs(1), "planner")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendError);
        assert!(err.to_string().contains("planner backend call failed"));
    }

    #[test]
    fn test_scripted_replies_repeat_last() {
        let client = ScriptedClient::replies(["a", "b"]);
        let texts: Vec<String> = (0..3)
            .map(|_| {
                client
                    .chat(ChatRequest::prompt("s", "u"))
                    .unwrap()
                    .text()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "b"]);
        assert_eq!(client.call_count(), 3);
    }
}
