// crates/core/src/memory.rs

//! Per-instruction execution memory.
//!
//! Holds the plan, completed steps and an index of identifiers extracted from
//! step outputs. Later planning calls read the index instead of full outputs,
//! which keeps prompts bounded no matter how verbose earlier steps were.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::prompt_utils::truncate;
use crate::types::ArgMap;

/// Most recent values shown per context key in a prompt.
const MAX_VALUES_PER_KEY: usize = 50;

/// `Message IDs: a1, a2` / `ID=42` / `event_ids: e1 e2`
static ID_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)(?:\b([a-z]+)[ _])?\bids?\b\s*[:=]\s*([^\n;|]+)")
        .expect("identifier marker pattern is valid")
});

static ID_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.@:/]*$").expect("identifier token pattern is valid")
});

/// Label words that describe the list rather than the kind of identifier.
const NOUN_STOPWORDS: &[&str] = &[
    "all", "and", "found", "item", "items", "listed", "matching", "new", "of", "returned", "the",
    "these", "with", "your",
];

/// One step that has run, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedStep {
    pub step_index: usize,
    pub instruction: String,
    pub command: String,
    pub raw_output: String,
}

/// One extraction stored under a context key.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub step_index: usize,
    pub values: Vec<String>,
}

/// Advisory problem noticed while absorbing a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepWarning {
    /// An identifier already consumed by an earlier invocation was used again.
    ReusedIdentifier {
        step_index: usize,
        identifier: String,
        command: String,
    },
}

impl fmt::Display for StepWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepWarning::ReusedIdentifier {
                step_index,
                identifier,
                command,
            } => write!(
                f,
                "WARNING: step {} reused identifier '{}' in `{}`",
                step_index + 1,
                identifier,
                command
            ),
        }
    }
}

/// Memory for one top-level instruction. Dropped when the instruction ends.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMemory {
    pub original_request: String,
    pub plan: Vec<String>,
    pub categories: Vec<String>,
    completed_steps: Vec<CompletedStep>,
    /// Append-only: keys are never removed, each extraction is kept.
    context: BTreeMap<String, Vec<ContextEntry>>,
    consumed: Vec<String>,
}

impl ExecutionMemory {
    pub fn new(original_request: impl Into<String>, plan: Vec<String>, categories: Vec<String>) -> Self {
        Self {
            original_request: original_request.into(),
            plan,
            categories,
            completed_steps: Vec::new(),
            context: BTreeMap::new(),
            consumed: Vec::new(),
        }
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    pub fn record_step(&mut self, step: CompletedStep) {
        self.completed_steps.push(step);
    }

    pub fn context_keys(&self) -> impl Iterator<Item = &str> {
        self.context.keys().map(String::as_str)
    }

    /// Latest values stored under `key`.
    pub fn context_value(&self, key: &str) -> Option<&[String]> {
        self.context
            .get(key)
            .and_then(|entries| entries.last())
            .map(|e| e.values.as_slice())
    }

    pub fn context_history(&self, key: &str) -> &[ContextEntry] {
        self.context.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Append values under `key`. Empty value lists are ignored.
    pub fn merge_context(&mut self, key: impl Into<String>, step_index: usize, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        self.context
            .entry(key.into())
            .or_default()
            .push(ContextEntry { step_index, values });
    }

    /// Scan `raw_output` for identifier markers and index them under the
    /// producing namespace. Returns the keys written.
    pub fn index_output(&mut self, namespace: &str, step_index: usize, raw_output: &str) -> Vec<String> {
        let mut written = Vec::new();
        for (noun, values) in extract_identifiers(raw_output) {
            let key = match noun {
                Some(noun) => format!("{}:last_{}_ids", namespace, noun),
                None => format!("{}:last_ids", namespace),
            };
            self.merge_context(key.clone(), step_index, values);
            written.push(key);
        }
        written
    }

    /// Every identifier ever indexed in this instruction.
    pub fn known_identifiers(&self) -> BTreeSet<&str> {
        self.context
            .values()
            .flatten()
            .flat_map(|e| e.values.iter().map(String::as_str))
            .collect()
    }

    pub fn consumed_identifiers(&self) -> &[String] {
        &self.consumed
    }

    /// Record identifiers consumed by one invocation.
    ///
    /// Returns a warning for each identifier that had already been consumed.
    /// Reuse is advisory: nothing is rejected.
    pub fn consume(&mut self, step_index: usize, command: &str, args: &ArgMap) -> Vec<StepWarning> {
        let known: BTreeSet<String> = self
            .known_identifiers()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut warnings = Vec::new();
        for value in args.values().flat_map(string_values) {
            if !known.contains(value) {
                continue;
            }
            if self.consumed.iter().any(|c| c == value) {
                warnings.push(StepWarning::ReusedIdentifier {
                    step_index,
                    identifier: value.to_string(),
                    command: command.to_string(),
                });
            } else {
                self.consumed.push(value.to_string());
            }
        }
        warnings
    }

    /// Context index as prompt text.
    pub fn render_context(&self) -> String {
        if self.context.is_empty() {
            return "(empty)".to_string();
        }
        self.context
            .keys()
            .filter_map(|key| {
                self.context_value(key).map(|values| {
                    let shown = &values[values.len().saturating_sub(MAX_VALUES_PER_KEY)..];
                    format!("- {}: {}", key, shown.join(", "))
                })
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Completed steps as prompt text, each output cut to `max_output` chars.
    pub fn render_completed(&self, max_output: usize) -> String {
        if self.completed_steps.is_empty() {
            return "(none yet)".to_string();
        }
        self.completed_steps
            .iter()
            .map(|s| {
                format!(
                    "Step {}: {}\n  command: {}\n  output: {}",
                    s.step_index + 1,
                    s.instruction,
                    s.command,
                    truncate(&s.raw_output, max_output)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn string_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Extract identifier lists from a capability's output, grouped by the noun
/// of their label (`Message IDs` -> `message`). JSON outputs are walked for
/// `id`, `ids` and `*_id(s)` fields.
pub fn extract_identifiers(raw_output: &str) -> Vec<(Option<String>, Vec<String>)> {
    let mut groups: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();

    if let Ok(json) = serde_json::from_str::<Value>(raw_output.trim()) {
        collect_json_ids(&json, &mut groups);
    } else {
        for caps in ID_MARKER.captures_iter(raw_output) {
            let noun = caps
                .get(1)
                .map(|m| m.as_str().to_ascii_lowercase())
                .filter(|n| !NOUN_STOPWORDS.contains(&n.as_str()));
            let values = caps
                .get(2)
                .map(|m| split_identifier_list(m.as_str()))
                .unwrap_or_default();
            push_unique(groups.entry(noun).or_default(), values);
        }
    }

    groups.into_iter().filter(|(_, v)| !v.is_empty()).collect()
}

fn collect_json_ids(value: &Value, groups: &mut BTreeMap<Option<String>, Vec<String>>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let lower = key.to_ascii_lowercase();
                let noun = if lower == "id" || lower == "ids" {
                    Some(None)
                } else {
                    lower
                        .strip_suffix("_ids")
                        .or_else(|| lower.strip_suffix("_id"))
                        .map(|n| Some(n.to_string()))
                };
                match noun {
                    Some(noun) => {
                        let values = match v {
                            Value::String(s) => vec![s.clone()],
                            Value::Number(n) => vec![n.to_string()],
                            Value::Array(items) => items
                                .iter()
                                .filter_map(|i| match i {
                                    Value::String(s) => Some(s.clone()),
                                    Value::Number(n) => Some(n.to_string()),
                                    _ => None,
                                })
                                .collect(),
                            _ => Vec::new(),
                        };
                        push_unique(groups.entry(noun).or_default(), values);
                    }
                    None => collect_json_ids(v, groups),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_json_ids(item, groups);
            }
        }
        _ => {}
    }
}

fn split_identifier_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(|t| t.trim_matches(|c: char| matches!(c, '"' | '\'' | '[' | ']' | '(' | ')' | '`')))
        .filter(|t| !t.is_empty())
        .take_while(|t| looks_like_identifier(t))
        .map(str::to_string)
        .collect()
}

fn looks_like_identifier(token: &str) -> bool {
    ID_TOKEN.is_match(token) && (token.chars().any(|c| c.is_ascii_digit()) || token.len() >= 8)
}

fn push_unique(target: &mut Vec<String>, values: Vec<String>) {
    for v in values {
        if !target.contains(&v) {
            target.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_plain_id_list() {
        let groups = extract_identifiers("IDs: a1, a2, a3");
        assert_eq!(groups, vec![(None, vec!["a1".into(), "a2".into(), "a3".into()])]);
    }

    #[test]
    fn test_extracts_labelled_ids_and_stops_at_prose() {
        let groups = extract_identifiers(
            "Found 2 messages\nMessage IDs: 18c2f1, 18c2f7 (newest first)\nEvent ID: evt_42",
        );
        assert_eq!(
            groups,
            vec![
                (Some("event".into()), vec!["evt_42".into()]),
                (Some("message".into()), vec!["18c2f1".into(), "18c2f7".into()]),
            ]
        );
    }

    #[test]
    fn test_extracts_json_ids() {
        let raw = json!({
            "messages": [
                {"id": "m1", "subject": "hi"},
                {"id": "m2", "thread_id": "t9"}
            ]
        })
        .to_string();
        let groups = extract_identifiers(&raw);
        assert_eq!(
            groups,
            vec![
                (None, vec!["m1".into(), "m2".into()]),
                (Some("thread".into()), vec!["t9".into()]),
            ]
        );
    }

    #[test]
    fn test_prose_without_markers_yields_nothing() {
        assert!(extract_identifiers("Nothing to see. Identity theft is bad.").is_empty());
        assert!(extract_identifiers("IDs: none").is_empty());
    }

    #[test]
    fn test_index_output_is_append_only() {
        let mut memory = ExecutionMemory::new("req", vec!["a".into()], vec![]);
        let keys = memory.index_output("mail", 0, "Message IDs: m1, m2");
        assert_eq!(keys, vec!["mail:last_message_ids"]);

        memory.index_output("mail", 2, "Message IDs: m7");
        assert_eq!(memory.context_value("mail:last_message_ids"), Some(&["m7".to_string()][..]));
        assert_eq!(memory.context_history("mail:last_message_ids").len(), 2);
        assert!(memory.known_identifiers().contains("m1"));
        assert!(memory.render_context().contains("mail:last_message_ids: m7"));
    }

    #[test]
    fn test_consume_flags_reuse_without_rejecting() {
        let mut memory = ExecutionMemory::new("req", vec![], vec![]);
        memory.index_output("items", 0, "IDs: a1, a2");

        let mut args = ArgMap::new();
        args.insert("id".into(), json!("a1"));
        assert!(memory.consume(1, "items:view id:a1", &args).is_empty());

        args.insert("note".into(), json!("not-an-id"));
        let warnings = memory.consume(2, "items:archive id:a1", &args);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("reused identifier 'a1'"));
        assert_eq!(memory.consumed_identifiers(), &["a1".to_string()]);
    }

    #[test]
    fn test_render_completed_truncates_outputs() {
        let mut memory = ExecutionMemory::new("req", vec!["list".into()], vec![]);
        memory.record_step(CompletedStep {
            step_index: 0,
            instruction: "list".into(),
            command: "items:list".into(),
            raw_output: "x".repeat(500),
        });
        let text = memory.render_completed(40);
        assert!(text.contains("Step 1: list"));
        assert!(text.len() < 200);
    }
}
