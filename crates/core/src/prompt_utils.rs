// crates/core/src/prompt_utils.rs

//! Shared helpers for building prompts and reading model replies.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::ai_client::{chat_with_deadline, AiClient, ChatRequest};
use crate::error::OrchestratorError;
use crate::types::CatalogEntry;

/// Appended to a prompt when the previous reply could not be used.
pub const STRICT_FORMAT_NOTICE: &str = "Your previous reply could not be used. Reply with ONLY one JSON object matching the schema above: no prose, no code fences, no comments.";

/// Ask for a structured reply, retrying once with a stricter prompt.
///
/// `build` receives the previous failure on the retry. Timeouts and backend
/// errors are returned as-is; two unusable replies become a
/// `Classification` error carrying both failures.
pub fn ask_structured<T, B, V>(
    client: &Arc<dyn AiClient>,
    timeout: Duration,
    stage: &'static str,
    mut build: B,
    validate: V,
) -> Result<T, OrchestratorError>
where
    T: DeserializeOwned,
    B: FnMut(Option<&str>) -> ChatRequest,
    V: Fn(&T) -> Result<(), String>,
{
    let mut attempts: Vec<String> = Vec::new();

    for attempt in 1..=2 {
        let request = build(attempts.last().map(String::as_str));
        let response = chat_with_deadline(client, request, timeout, stage)?;

        match parse_reply::<T>(response.text()).and_then(|v| validate(&v).map(|_| v)) {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(stage, attempt, error = %e, "unusable structured reply");
                attempts.push(e);
            }
        }
    }

    Err(OrchestratorError::Classification { stage, attempts })
}

/// Pull the first JSON object out of a model reply.
///
/// Models wrap JSON in code fences or chatter around it; everything outside
/// the outermost braces is ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a reply as `T`, describing the failure in a way that can be fed
/// back to the model.
pub fn parse_reply<T: DeserializeOwned>(reply: Option<&str>) -> Result<T, String> {
    let text = reply.ok_or_else(|| "empty reply".to_string())?;
    let json = extract_json_object(text)
        .ok_or_else(|| format!("no JSON object in reply: {}", truncate(text, 200)))?;
    serde_json::from_str(json).map_err(|e| format!("reply did not match the schema: {}", e))
}

/// Render a catalog as one line per capability.
pub fn render_catalog(catalog: &[CatalogEntry]) -> String {
    if catalog.is_empty() {
        return "(no capabilities)".to_string();
    }
    catalog
        .iter()
        .map(|c| format!("- {}: {}\n  usage: {}", c.key(), c.summary, c.usage))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate to at most `max` characters, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() > max {
        let head: String = trimmed.chars().take(max).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Reply {
        kind: String,
    }

    #[test]
    fn test_extracts_fenced_json() {
        let text = "Sure!\n```json\n{\"kind\": \"plan\"}\n```";
        assert_eq!(extract_json_object(text), Some("{\"kind\": \"plan\"}"));
        let reply: Reply = parse_reply(Some(text)).unwrap();
        assert_eq!(reply.kind, "plan");
    }

    #[test]
    fn test_parse_reply_errors_are_descriptive() {
        let err = parse_reply::<Reply>(Some("no json here")).unwrap_err();
        assert!(err.starts_with("no JSON object"));
        let err = parse_reply::<Reply>(Some("{\"other\": 1}")).unwrap_err();
        assert!(err.contains("schema"));
        assert_eq!(parse_reply::<Reply>(None).unwrap_err(), "empty reply");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("  short ", 10), "short");
    }

    #[test]
    fn test_ask_structured_retries_once_then_fails() {
        use crate::ai_client::ScriptedClient;
        use crate::error::ErrorKind;

        let scripted = Arc::new(ScriptedClient::replies(["garbage", "{\"kind\": \"\"}"]));
        let client: Arc<dyn AiClient> = scripted.clone();
        let err = ask_structured::<Reply, _, _>(
            &client,
            Duration::from_secs(1),
            "test",
            |prev| {
                let mut user = "go".to_string();
                if let Some(prev) = prev {
                    user.push_str(&format!("\n{}\n{}", prev, STRICT_FORMAT_NOTICE));
                }
                ChatRequest::prompt("sys", user)
            },
            |r| {
                if r.kind.is_empty() {
                    Err("kind is empty".into())
                } else {
                    Ok(())
                }
            },
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ClassificationError);
        assert!(err.to_string().contains("kind is empty"));
        let requests = scripted.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].transcript().contains(STRICT_FORMAT_NOTICE));
    }
}
