// crates/core/src/classifier/mod.rs

//! Stage 1: decide between a direct answer and an ordered step plan.

mod prompts;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai_client::{AiClient, ChatRequest};
use crate::error::Result;
use crate::prompt_utils::ask_structured;

/// What stage 1 decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Classification {
    DirectAnswer {
        text: String,
    },
    Plan {
        steps: Vec<String>,
        relevant_categories: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawClassification {
    Answer {
        answer: String,
    },
    Plan {
        steps: Vec<String>,
        #[serde(default)]
        categories: Vec<String>,
    },
}

impl RawClassification {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            RawClassification::Answer { answer } if answer.trim().is_empty() => {
                Err("answer is empty".to_string())
            }
            RawClassification::Plan { steps, .. } if steps.iter().all(|s| s.trim().is_empty()) => {
                Err("plan has no steps".to_string())
            }
            _ => Ok(()),
        }
    }
}

pub struct Classifier {
    client: Arc<dyn AiClient>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(client: Arc<dyn AiClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Classify `instruction` against the known `categories`.
    ///
    /// Relevant categories are restricted to known ones; when none survive
    /// the filter every category is considered relevant.
    pub fn classify(&self, instruction: &str, categories: &[String]) -> Result<Classification> {
        let system = prompts::build_classifier_prompt(categories);

        let raw: RawClassification = ask_structured(
            &self.client,
            self.timeout,
            "classifier",
            |previous| {
                ChatRequest::prompt(system.clone(), prompts::build_user_message(instruction, previous))
                    .json_object()
            },
            RawClassification::validate,
        )?;

        let classification = match raw {
            RawClassification::Answer { answer } => Classification::DirectAnswer {
                text: answer.trim().to_string(),
            },
            RawClassification::Plan {
                steps,
                categories: wanted,
            } => {
                let steps: Vec<String> = steps
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();

                let mut relevant: Vec<String> = categories
                    .iter()
                    .filter(|known| wanted.iter().any(|w| w.trim().eq_ignore_ascii_case(known)))
                    .cloned()
                    .collect();
                if relevant.is_empty() {
                    relevant = categories.to_vec();
                }

                Classification::Plan {
                    steps,
                    relevant_categories: relevant,
                }
            }
        };

        match &classification {
            Classification::DirectAnswer { .. } => tracing::info!("classified as direct answer"),
            Classification::Plan {
                steps,
                relevant_categories,
            } => tracing::info!(
                steps = steps.len(),
                categories = ?relevant_categories,
                "classified as plan"
            ),
        }

        Ok(classification)
    }
}
