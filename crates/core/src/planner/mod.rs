// crates/core/src/planner/mod.rs

//! Stage 2: per-step planning against the live registry and execution memory.

mod prompts;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::ai_client::{AiClient, ChatRequest};
use crate::capability_registry::{CapabilityRegistry, InvocationOutcome};
use crate::command;
use crate::generated_store::is_package_segment;
use crate::error::Result;
use crate::memory::{CompletedStep, ExecutionMemory, StepWarning};
use crate::prompt_utils::ask_structured;
use crate::synthesizer::SynthesisRequest;

/// What to do for the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Run a registered capability, possibly a `&&` chain.
    ExecuteExisting { command: String, independent: bool },
    /// No capability fits; create one.
    NeedsSynthesis(SynthesisRequest),
    /// The step is answered from results already in memory.
    LocalCompute { result: String },
    /// Nothing left to do.
    Complete,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RawAction {
    Execute {
        command: String,
        #[serde(default)]
        independent: bool,
    },
    Synthesize {
        namespace: String,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        example_usage: String,
    },
    Compute {
        result: String,
    },
    Complete,
}

pub struct ExecutionPlanner {
    client: Arc<dyn AiClient>,
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl ExecutionPlanner {
    pub fn new(client: Arc<dyn AiClient>, registry: Arc<CapabilityRegistry>, timeout: Duration) -> Self {
        Self {
            client,
            registry,
            timeout,
        }
    }

    /// Decide the action for step `step_index`.
    ///
    /// The catalog is rebuilt on every call so capabilities registered by
    /// synthesis are visible to the re-plan of the same step.
    pub fn plan_step(&self, memory: &ExecutionMemory, step_index: usize) -> Result<PlannedAction> {
        let catalog = self.registry.catalog_for(&memory.categories);
        let system = prompts::build_planner_prompt(&catalog);

        let raw: RawAction = ask_structured(
            &self.client,
            self.timeout,
            "planner",
            |previous| {
                ChatRequest::prompt(
                    system.clone(),
                    prompts::build_user_message(memory, step_index, previous),
                )
                .json_object()
            },
            |raw| self.validate(raw),
        )?;

        let action = match raw {
            RawAction::Execute {
                command,
                independent,
            } => PlannedAction::ExecuteExisting {
                command: command.trim().to_string(),
                independent,
            },
            RawAction::Synthesize {
                namespace,
                name,
                description,
                example_usage,
            } => PlannedAction::NeedsSynthesis(SynthesisRequest {
                namespace: namespace.trim().to_ascii_lowercase(),
                name: name.trim().to_ascii_lowercase(),
                description: if description.trim().is_empty() {
                    memory.plan.get(step_index).cloned().unwrap_or_default()
                } else {
                    description
                },
                example_usage,
            }),
            RawAction::Compute { result } => PlannedAction::LocalCompute { result },
            RawAction::Complete => PlannedAction::Complete,
        };

        tracing::debug!(step = step_index + 1, action = ?action, "planned step");
        Ok(action)
    }

    /// Reject replies that cannot be acted on, so the retry can correct them.
    fn validate(&self, raw: &RawAction) -> std::result::Result<(), String> {
        match raw {
            RawAction::Execute { command, .. } => {
                let segments = command::split_chain(command).map_err(|e| e.to_string())?;
                for segment in segments {
                    let (namespace, name, _) =
                        command::split_head(&segment).map_err(|e| e.to_string())?;
                    if !self.registry.contains(&namespace, &name) {
                        return Err(format!(
                            "'{}:{}' is not a registered capability; pick one from the list or use synthesize",
                            namespace, name
                        ));
                    }
                }
                Ok(())
            }
            RawAction::Synthesize {
                namespace, name, ..
            } => {
                let namespace = namespace.trim().to_ascii_lowercase();
                let name = name.trim().to_ascii_lowercase();
                if !is_package_segment(&namespace) || !is_package_segment(&name) {
                    return Err(format!(
                        "'{}:{}' is not a valid name for a new capability (start with a letter; lowercase letters, digits and single '_')",
                        namespace, name
                    ));
                }
                if self.registry.contains(&namespace, &name) {
                    return Err(format!(
                        "'{}:{}' already exists; use execute instead",
                        namespace, name
                    ));
                }
                Ok(())
            }
            RawAction::Compute { result } if result.trim().is_empty() => {
                Err("compute result is empty".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Fold the outcomes of an executed step into memory.
    ///
    /// The step is appended before anything else, so the next planning call
    /// always sees it. Identifiers consumed by this step are recorded before
    /// the step's own outputs are indexed.
    pub fn absorb(
        &self,
        memory: &mut ExecutionMemory,
        step_index: usize,
        description: &str,
        command: &str,
        outcomes: &[InvocationOutcome],
    ) -> Vec<StepWarning> {
        memory.record_step(CompletedStep {
            step_index,
            instruction: description.to_string(),
            command: command.to_string(),
            raw_output: combined_output(outcomes),
        });

        let mut warnings = Vec::new();
        for outcome in outcomes {
            warnings.extend(memory.consume(step_index, &outcome.command, &outcome.arguments));
        }

        for outcome in outcomes {
            if let (Ok(output), Some(namespace)) = (&outcome.result, outcome.namespace()) {
                let keys = memory.index_output(namespace, step_index, output);
                if !keys.is_empty() {
                    tracing::debug!(step = step_index + 1, keys = ?keys, "indexed step output");
                }
            }
        }

        for warning in &warnings {
            tracing::warn!(step = step_index + 1, "{}", warning);
        }
        warnings
    }
}

fn combined_output(outcomes: &[InvocationOutcome]) -> String {
    let render = |o: &InvocationOutcome| match &o.result {
        Ok(output) => output.clone(),
        Err(report) => report.to_string(),
    };

    match outcomes {
        [single] => render(single),
        _ => outcomes
            .iter()
            .map(|o| format!("[{}] {}", o.command, render(o)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
