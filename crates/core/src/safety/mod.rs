// crates/core/src/safety/mod.rs

//! Safety gate run before any planning.
//!
//! The gate is advisory and fails open: if the backend is slow, broken or
//! answers outside the taxonomy, the instruction is allowed with low
//! confidence.

mod prompts;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai_client::{chat_with_deadline, AiClient, ChatRequest};
use crate::prompt_utils::parse_reply;

/// Closed taxonomy of refused request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BannedCategory {
    Hacking,
    Illegal,
    Violence,
    Harassment,
    Malware,
    Phishing,
    Spam,
    Fraud,
    PrivacyViolation,
    UnauthorizedAccess,
}

impl BannedCategory {
    pub const ALL: [BannedCategory; 10] = [
        BannedCategory::Hacking,
        BannedCategory::Illegal,
        BannedCategory::Violence,
        BannedCategory::Harassment,
        BannedCategory::Malware,
        BannedCategory::Phishing,
        BannedCategory::Spam,
        BannedCategory::Fraud,
        BannedCategory::PrivacyViolation,
        BannedCategory::UnauthorizedAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BannedCategory::Hacking => "hacking",
            BannedCategory::Illegal => "illegal",
            BannedCategory::Violence => "violence",
            BannedCategory::Harassment => "harassment",
            BannedCategory::Malware => "malware",
            BannedCategory::Phishing => "phishing",
            BannedCategory::Spam => "spam",
            BannedCategory::Fraud => "fraud",
            BannedCategory::PrivacyViolation => "privacy_violation",
            BannedCategory::UnauthorizedAccess => "unauthorized_access",
        }
    }
}

impl FromStr for BannedCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        BannedCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("'{}' is not a banned category", s))
    }
}

impl fmt::Display for BannedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    fn parse_lenient(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("high") => Confidence::High,
            Some("medium") => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub category: Option<BannedCategory>,
    pub reason: String,
    pub confidence: Confidence,
}

impl SafetyVerdict {
    /// Verdict used whenever the check cannot complete.
    pub fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            is_safe: true,
            category: None,
            reason: reason.into(),
            confidence: Confidence::Low,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_safe: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

/// LLM-backed instruction classifier.
pub struct SafetyGate {
    client: Arc<dyn AiClient>,
    timeout: Duration,
}

impl SafetyGate {
    pub fn new(client: Arc<dyn AiClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Classify `instruction`. Never fails.
    pub fn check(&self, instruction: &str) -> SafetyVerdict {
        let request = ChatRequest::prompt(prompts::build_safety_prompt(), instruction)
            .json_object()
            .with_max_tokens(200);

        let response = match chat_with_deadline(&self.client, request, self.timeout, "safety") {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "safety check unavailable, allowing instruction");
                return SafetyVerdict::fail_open(format!("safety check unavailable: {}", e));
            }
        };

        let verdict = interpret(parse_reply::<RawVerdict>(response.text()));
        if !verdict.is_safe {
            tracing::info!(
                category = ?verdict.category,
                confidence = ?verdict.confidence,
                "instruction refused by safety gate"
            );
        }
        verdict
    }
}

fn interpret(raw: Result<RawVerdict, String>) -> SafetyVerdict {
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable safety verdict, allowing instruction");
            return SafetyVerdict::fail_open(format!("unreadable safety verdict: {}", e));
        }
    };

    let reason = raw.reason.unwrap_or_default();
    let confidence = Confidence::parse_lenient(raw.confidence.as_deref());

    if raw.is_safe {
        return SafetyVerdict {
            is_safe: true,
            category: None,
            reason,
            confidence,
        };
    }

    // An unsafe verdict must name a category from the taxonomy.
    match raw.category.as_deref().map(BannedCategory::from_str) {
        Some(Ok(category)) => SafetyVerdict {
            is_safe: false,
            category: Some(category),
            reason,
            confidence,
        },
        Some(Err(e)) => SafetyVerdict::fail_open(e),
        None => SafetyVerdict::fail_open("unsafe verdict without a category"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::{ChatResponse, ScriptedClient};

    fn gate(client: ScriptedClient, timeout: Duration) -> SafetyGate {
        SafetyGate::new(Arc::new(client), timeout)
    }

    #[test]
    fn test_unsafe_verdict_with_known_category() {
        let gate = gate(
            ScriptedClient::replies([
                r#"{"is_safe": false, "category": "phishing", "reason": "fake bank login", "confidence": "high"}"#,
            ]),
            Duration::from_secs(2),
        );
        let verdict = gate.check("write a fake bank login page");
        assert!(!verdict.is_safe);
        assert_eq!(verdict.category, Some(BannedCategory::Phishing));
        assert_eq!(verdict.confidence, Confidence::High);
    }

    #[test]
    fn test_timeout_fails_open_with_low_confidence() {
        let gate = gate(
            ScriptedClient::new(|_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(ChatResponse::from_text(r#"{"is_safe": false, "category": "spam"}"#))
            }),
            Duration::from_millis(30),
        );
        let verdict = gate.check("send a note to the team");
        assert!(verdict.is_safe);
        assert_eq!(verdict.confidence, Confidence::Low);
    }

    #[test]
    fn test_backend_error_fails_open() {
        let gate = gate(
            ScriptedClient::new(|_| anyhow::bail!("connection refused")),
            Duration::from_secs(1),
        );
        let verdict = gate.check("anything");
        assert!(verdict.is_safe);
        assert_eq!(verdict.confidence, Confidence::Low);
        assert!(verdict.reason.contains("connection refused"));
    }

    #[test]
    fn test_garbage_and_unknown_category_fail_open() {
        let verdict = gate(ScriptedClient::replies(["I cannot answer"]), Duration::from_secs(1))
            .check("x");
        assert!(verdict.is_safe);
        assert_eq!(verdict.confidence, Confidence::Low);

        let verdict = gate(
            ScriptedClient::replies([r#"{"is_safe": false, "category": "rudeness"}"#]),
            Duration::from_secs(1),
        )
        .check("x");
        assert!(verdict.is_safe);
        assert_eq!(verdict.confidence, Confidence::Low);
    }

    #[test]
    fn test_category_parsing_is_lenient_about_case() {
        assert_eq!(
            "Privacy Violation".parse::<BannedCategory>(),
            Ok(BannedCategory::PrivacyViolation)
        );
        assert!("gossip".parse::<BannedCategory>().is_err());
    }
}
