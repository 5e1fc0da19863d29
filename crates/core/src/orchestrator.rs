// crates/core/src/orchestrator.rs

//! Top-level flow: safety gate, classification, then the per-step planning
//! loop with on-demand synthesis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::ai_client::AiClient;
use crate::capability_registry::{CapabilityRegistry, ChainMode, InvocationOutcome};
use crate::classifier::{Classification, Classifier};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::memory::{CompletedStep, ExecutionMemory, StepWarning};
use crate::planner::{ExecutionPlanner, PlannedAction};
use crate::safety::{SafetyGate, SafetyVerdict};
use crate::synthesizer::{CapabilitySandbox, CapabilitySynthesizer};
use crate::types::{ArgMap, Extras};

/// Command recorded for steps answered without invoking a capability.
const LOCAL_COMMAND: &str = "(local)";

/// Cooperative cancellation, checked before each planning iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
    Computed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based position in the plan.
    pub number: usize,
    pub description: String,
    pub command: String,
    pub status: StepStatus,
    pub outcomes: Vec<InvocationOutcome>,
    /// Result of a locally computed step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Refused,
    Answered {
        text: String,
    },
    Executed {
        steps: Vec<StepReport>,
        /// Capabilities created while serving the instruction.
        synthesized: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InstructionReport {
    pub instruction: String,
    pub safety: SafetyVerdict,
    pub outcome: Outcome,
    pub warnings: Vec<StepWarning>,
}

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    safety: SafetyGate,
    classifier: Classifier,
    planner: ExecutionPlanner,
    synthesizer: CapabilitySynthesizer,
    max_iterations: usize,
    concurrent_chains: bool,
    cancellation: CancellationFlag,
}

impl Orchestrator {
    /// `classifier_client` serves safety, classification, planning and
    /// elaboration; `codegen_client` serves synthesis only.
    pub fn new(
        config: &OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        classifier_client: Arc<dyn AiClient>,
        codegen_client: Arc<dyn AiClient>,
        sandbox: Arc<dyn CapabilitySandbox>,
    ) -> Self {
        let timeouts = &config.timeouts;
        Self {
            safety: SafetyGate::new(Arc::clone(&classifier_client), timeouts.safety()),
            classifier: Classifier::new(Arc::clone(&classifier_client), timeouts.classifier()),
            planner: ExecutionPlanner::new(
                Arc::clone(&classifier_client),
                Arc::clone(&registry),
                timeouts.planner(),
            ),
            synthesizer: CapabilitySynthesizer::new(
                classifier_client,
                codegen_client,
                Arc::clone(&registry),
                sandbox,
                config,
            ),
            registry,
            max_iterations: config.max_iterations,
            concurrent_chains: config.concurrent_chains,
            cancellation: CancellationFlag::default(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn synthesizer(&self) -> &CapabilitySynthesizer {
        &self.synthesizer
    }

    /// Handle to cancel the instruction currently running.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    /// Serve one top-level instruction.
    pub fn run(&self, instruction: &str) -> Result<InstructionReport> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(OrchestratorError::argument("instruction is empty"));
        }

        let safety = self.safety.check(instruction);
        if !safety.is_safe {
            return Ok(InstructionReport {
                instruction: instruction.to_string(),
                safety,
                outcome: Outcome::Refused,
                warnings: Vec::new(),
            });
        }

        let categories = self.registry.list_categories();
        let (steps, relevant) = match self.classifier.classify(instruction, &categories)? {
            Classification::DirectAnswer { text } => {
                return Ok(InstructionReport {
                    instruction: instruction.to_string(),
                    safety,
                    outcome: Outcome::Answered { text },
                    warnings: Vec::new(),
                });
            }
            Classification::Plan {
                steps,
                relevant_categories,
            } => (steps, relevant_categories),
        };

        let mut memory = ExecutionMemory::new(instruction, steps, relevant);
        let (steps, synthesized, warnings) = self.execute_plan(&mut memory)?;

        Ok(InstructionReport {
            instruction: instruction.to_string(),
            safety,
            outcome: Outcome::Executed { steps, synthesized },
            warnings,
        })
    }

    fn execute_plan(
        &self,
        memory: &mut ExecutionMemory,
    ) -> Result<(Vec<StepReport>, Vec<String>, Vec<StepWarning>)> {
        let mut reports = Vec::new();
        let mut synthesized = Vec::new();
        let mut warnings = Vec::new();
        let mut step_index = 0;
        let mut iterations = 0;

        while step_index < memory.plan.len() {
            if self.cancellation.is_cancelled() {
                tracing::info!(step = step_index + 1, "instruction cancelled");
                return Err(OrchestratorError::Cancelled {
                    step: step_index + 1,
                });
            }
            if iterations >= self.max_iterations {
                return Err(OrchestratorError::IncompleteWorkflow {
                    iterations,
                    completed: step_index,
                    planned: memory.plan.len(),
                });
            }
            iterations += 1;

            let description = memory.plan[step_index].clone();
            tracing::info!(step = step_index + 1, description = %description, "planning step");

            match self.planner.plan_step(memory, step_index)? {
                PlannedAction::ExecuteExisting {
                    command,
                    independent,
                } => {
                    let mode = if self.concurrent_chains && independent {
                        ChainMode::Concurrent
                    } else {
                        ChainMode::Sequential
                    };
                    let outcomes = self
                        .registry
                        .execute_chain(&command, &memory.original_request, mode)
                        .unwrap_or_else(|e| vec![unparsed_outcome(&command, e)]);

                    warnings.extend(self.planner.absorb(
                        memory,
                        step_index,
                        &description,
                        &command,
                        &outcomes,
                    ));
                    reports.push(StepReport {
                        number: step_index + 1,
                        description,
                        command,
                        status: chain_status(&outcomes),
                        outcomes,
                        result: None,
                    });
                    step_index += 1;
                }
                PlannedAction::NeedsSynthesis(request) => {
                    let original = memory.original_request.clone();
                    match self.synthesizer.synthesize_capability(&request, &original) {
                        Ok(descriptor) => {
                            synthesized.push(descriptor.key());
                        }
                        // Registered meanwhile; the re-plan will see it.
                        Err(OrchestratorError::DuplicateKey(key)) => {
                            tracing::debug!(key = %key, "capability already present, re-planning");
                        }
                        Err(OrchestratorError::SynthesisExhausted { key, attempts, .. }) => {
                            return Err(OrchestratorError::SynthesisExhausted {
                                key,
                                attempts,
                                completed: reports,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                    if !memory.categories.contains(&request.namespace) {
                        memory.categories.push(request.namespace.clone());
                    }
                    // Same step again, now with the new capability in the catalog.
                }
                PlannedAction::LocalCompute { result } => {
                    memory.record_step(CompletedStep {
                        step_index,
                        instruction: description.clone(),
                        command: LOCAL_COMMAND.to_string(),
                        raw_output: result.clone(),
                    });
                    reports.push(StepReport {
                        number: step_index + 1,
                        description,
                        command: LOCAL_COMMAND.to_string(),
                        status: StepStatus::Computed,
                        outcomes: Vec::new(),
                        result: Some(result),
                    });
                    step_index += 1;
                }
                PlannedAction::Complete => {
                    tracing::info!(step = step_index + 1, "planner reported completion");
                    break;
                }
            }
        }

        Ok((reports, synthesized, warnings))
    }
}

fn chain_status(outcomes: &[InvocationOutcome]) -> StepStatus {
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    match failed {
        0 => StepStatus::Succeeded,
        n if n == outcomes.len() => StepStatus::Failed,
        _ => StepStatus::PartiallyFailed,
    }
}

fn unparsed_outcome(command: &str, error: OrchestratorError) -> InvocationOutcome {
    InvocationOutcome {
        command: command.to_string(),
        capability: None,
        arguments: ArgMap::new(),
        result: Err(error.report()),
        extras: Extras::new(),
    }
}
