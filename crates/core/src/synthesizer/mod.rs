// crates/core/src/synthesizer/mod.rs

//! On-demand creation of capabilities.
//!
//! Two LLM phases: the classification backend elaborates a terse request into
//! a specification, then the code-generation backend writes the crate. The
//! result is validated, staged in the generated store, dry-run, loaded and
//! registered. Every failed attempt consumes one unit of the per-key quota
//! and is fed back into the next attempt.

mod prompts;
mod quota;
mod validation;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai_client::{chat_with_deadline, AiClient, ChatRequest, TokenUsage};
use crate::capability_registry::CapabilityRegistry;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::generated_store::{is_package_segment, package_name, GeneratedStore};
use crate::prompt_utils::parse_reply;
use crate::types::{capability_key, CapabilityDescriptor, CapabilityOrigin, CatalogEntry, ParameterSpec};

pub use quota::SynthesisQuota;
pub use validation::{check_imports, static_check, CapabilitySandbox, ValidationPipeline};

/// What the planner asks to have created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub namespace: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub example_usage: String,
}

impl SynthesisRequest {
    pub fn key(&self) -> String {
        capability_key(&self.namespace, &self.name)
    }
}

/// Everything the code-generation phase works from.
#[derive(Debug, Clone)]
pub struct SynthesisRecipe {
    pub namespace: String,
    pub name: String,
    pub user_request: String,
    /// Output of the elaboration phase.
    pub specification: String,
    pub catalog: Vec<CatalogEntry>,
    /// 1-based attempt number for this key.
    pub attempt: u32,
}

/// Pipeline stage an attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStage {
    Elaboration,
    Generation,
    Syntax,
    StaticCheck,
    DryRun,
    Persist,
    Load,
    Register,
}

impl SynthesisStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStage::Elaboration => "elaboration",
            SynthesisStage::Generation => "generation",
            SynthesisStage::Syntax => "syntax check",
            SynthesisStage::StaticCheck => "static check",
            SynthesisStage::DryRun => "dry run",
            SynthesisStage::Persist => "persist",
            SynthesisStage::Load => "load",
            SynthesisStage::Register => "register",
        }
    }
}

impl fmt::Display for SynthesisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Rejected { stage: SynthesisStage, error: String },
}

/// A generated crate before and after validation.
#[derive(Debug, Clone)]
pub struct GeneratedCapability {
    pub namespace: String,
    pub name: String,
    pub summary: String,
    pub parameters: Vec<ParameterSpec>,
    /// Contents of `src/lib.rs`.
    pub source: String,
    /// Contents of `tests/self_test.rs`.
    pub self_test: String,
    pub status: ValidationStatus,
}

/// Record of one failed synthesis attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisAttempt {
    pub attempt: u32,
    pub stage: SynthesisStage,
    pub error: String,
    pub usage: TokenUsage,
    pub at: DateTime<Utc>,
}

impl SynthesisAttempt {
    pub fn failed(attempt: u32, stage: SynthesisStage, error: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            attempt,
            stage,
            error: error.into(),
            usage,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for SynthesisAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {} failed at {}: {}", self.attempt, self.stage, self.error)
    }
}

/// JSON shape the code-generation backend answers with.
#[derive(Debug, Deserialize)]
struct RawArtifact {
    summary: String,
    #[serde(default)]
    parameters: Vec<ParameterSpec>,
    source: String,
    #[serde(default)]
    self_test: String,
}

type StageResult<T> = std::result::Result<T, (SynthesisStage, String)>;

pub struct CapabilitySynthesizer {
    classifier: Arc<dyn AiClient>,
    codegen: Arc<dyn AiClient>,
    registry: Arc<CapabilityRegistry>,
    store: GeneratedStore,
    validation: ValidationPipeline,
    quota: SynthesisQuota,
    elaboration_timeout: Duration,
    synthesis_timeout: Duration,
}

impl CapabilitySynthesizer {
    pub fn new(
        classifier: Arc<dyn AiClient>,
        codegen: Arc<dyn AiClient>,
        registry: Arc<CapabilityRegistry>,
        sandbox: Arc<dyn CapabilitySandbox>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            classifier,
            codegen,
            validation: ValidationPipeline::new(sandbox, Arc::clone(&registry)),
            registry,
            store: GeneratedStore::new(&config.capabilities_root),
            quota: SynthesisQuota::new(config.synthesis_max_attempts),
            elaboration_timeout: config.timeouts.elaboration(),
            synthesis_timeout: config.timeouts.synthesis(),
        }
    }

    pub fn quota(&self) -> &SynthesisQuota {
        &self.quota
    }

    pub fn store(&self) -> &GeneratedStore {
        &self.store
    }

    /// Phase 1: expand `request` into a specification.
    pub fn elaborate(
        &self,
        request: &SynthesisRequest,
        user_request: &str,
        catalog: &[CatalogEntry],
    ) -> Result<(String, Option<TokenUsage>)> {
        let chat = ChatRequest::prompt(
            prompts::build_elaboration_prompt(),
            prompts::build_elaboration_message(request, user_request, catalog),
        );
        let response = chat_with_deadline(&self.classifier, chat, self.elaboration_timeout, "elaboration")?;
        let specification = response.text().unwrap_or_default().trim().to_string();
        if specification.is_empty() {
            return Err(OrchestratorError::backend("elaboration", "empty specification"));
        }
        Ok((specification, response.usage))
    }

    /// Phase 2: generate the crate sources for `recipe`.
    pub fn synthesize(
        &self,
        recipe: &SynthesisRecipe,
        feedback: Option<&str>,
    ) -> Result<(GeneratedCapability, Option<TokenUsage>)> {
        let package = package_name(&recipe.namespace, &recipe.name);
        let chat = ChatRequest::prompt(
            prompts::build_codegen_prompt(&package),
            prompts::build_codegen_message(recipe, feedback),
        )
        .json_object();
        let response = chat_with_deadline(&self.codegen, chat, self.synthesis_timeout, "synthesis")?;

        let raw: RawArtifact = parse_reply(response.text())
            .map_err(|e| OrchestratorError::backend("synthesis", format!("unusable reply: {}", e)))?;

        let artifact = GeneratedCapability {
            namespace: recipe.namespace.clone(),
            name: recipe.name.clone(),
            summary: raw.summary.trim().to_string(),
            parameters: raw.parameters,
            source: raw.source,
            self_test: raw.self_test,
            status: ValidationStatus::Pending,
        };
        Ok((artifact, response.usage))
    }

    /// Create, validate, persist and register the capability `request` names.
    ///
    /// Returns `SynthesisExhausted` without calling any backend once the
    /// key's quota is spent.
    pub fn synthesize_capability(
        &self,
        request: &SynthesisRequest,
        user_request: &str,
    ) -> Result<Arc<CapabilityDescriptor>> {
        let key = request.key();

        if !is_package_segment(&request.namespace) || !is_package_segment(&request.name) {
            return Err(OrchestratorError::argument(format!(
                "'{}' cannot name a generated capability (lowercase letters, digits and single '_')",
                key
            )));
        }
        if self.registry.contains(&request.namespace, &request.name) {
            return Err(OrchestratorError::DuplicateKey(key));
        }
        if self.quota.remaining(&key) == 0 {
            tracing::warn!(key = %key, "synthesis quota exhausted");
            return Err(OrchestratorError::SynthesisExhausted {
                attempts: self.quota.history(&key),
                key,
                completed: Vec::new(),
            });
        }

        let catalog = self.registry.export_catalog();
        let mut specification: Option<String> = None;
        let mut feedback: Option<String> = None;

        while let Some(attempt) = self.quota.try_acquire(&key) {
            tracing::info!(key = %key, attempt, "synthesizing capability");
            let mut usage = TokenUsage::default();

            let outcome = self
                .specification(&mut specification, request, user_request, &catalog, &mut usage)
                .and_then(|spec| {
                    let recipe = SynthesisRecipe {
                        namespace: request.namespace.clone(),
                        name: request.name.clone(),
                        user_request: user_request.to_string(),
                        specification: spec,
                        catalog: catalog.clone(),
                        attempt,
                    };
                    self.run_attempt(&recipe, feedback.as_deref(), &mut usage)
                });

            match outcome {
                Ok(descriptor) => {
                    tracing::info!(key = %key, attempt, tokens = usage.total(), "capability synthesized");
                    return Ok(descriptor);
                }
                Err((stage, error)) => {
                    tracing::warn!(key = %key, attempt, stage = %stage, error = %error, "synthesis attempt failed");
                    feedback = Some(format!("{} failed: {}", stage, error));
                    self.quota
                        .record_failure(&key, SynthesisAttempt::failed(attempt, stage, error, usage));
                }
            }
        }

        Err(OrchestratorError::SynthesisExhausted {
            attempts: self.quota.history(&key),
            key,
            completed: Vec::new(),
        })
    }

    /// Elaborate once per call; later attempts reuse the specification.
    fn specification(
        &self,
        cached: &mut Option<String>,
        request: &SynthesisRequest,
        user_request: &str,
        catalog: &[CatalogEntry],
        usage: &mut TokenUsage,
    ) -> StageResult<String> {
        if let Some(spec) = cached {
            return Ok(spec.clone());
        }
        let (spec, spent) = self
            .elaborate(request, user_request, catalog)
            .map_err(|e| (SynthesisStage::Elaboration, e.to_string()))?;
        usage.accumulate(spent);
        *cached = Some(spec.clone());
        Ok(spec)
    }

    fn run_attempt(
        &self,
        recipe: &SynthesisRecipe,
        feedback: Option<&str>,
        usage: &mut TokenUsage,
    ) -> StageResult<Arc<CapabilityDescriptor>> {
        let (mut artifact, spent) = self
            .synthesize(recipe, feedback)
            .map_err(|e| (SynthesisStage::Generation, e.to_string()))?;
        usage.accumulate(spent);

        let package = package_name(&artifact.namespace, &artifact.name);
        if let Err((stage, error)) = self.validation.check_source(&artifact, &package) {
            artifact.status = ValidationStatus::Rejected {
                stage,
                error: error.clone(),
            };
            return Err((stage, error));
        }

        let staged = self
            .store
            .stage(&artifact)
            .map_err(|e| (SynthesisStage::Persist, format!("{:#}", e)))?;

        let installed = self
            .validation
            .dry_run(&staged.dir, &package)
            .and_then(|report| {
                tracing::debug!(package = %package, report = %report, "self-tests passed");
                artifact.status = ValidationStatus::Validated;
                self.validation
                    .sandbox()
                    .load(&staged.dir, &package)
                    .map_err(|e| (SynthesisStage::Load, format!("{:#}", e)))
            })
            .and_then(|handler| {
                self.store
                    .commit(&artifact.namespace, &artifact.name)
                    .map_err(|e| (SynthesisStage::Persist, format!("{:#}", e)))?;
                Ok(handler)
            });

        let handler = match installed {
            Ok(handler) => handler,
            Err(failure) => {
                if let Err(e) = self.store.discard(&artifact.namespace, &artifact.name) {
                    tracing::warn!(error = %e, "failed to discard pending capability");
                }
                return Err(failure);
            }
        };

        let descriptor = CapabilityDescriptor::new(
            artifact.namespace.clone(),
            artifact.name.clone(),
            artifact.summary.clone(),
            handler,
        )
        .with_parameters(artifact.parameters)
        .with_origin(CapabilityOrigin::Generated);

        self.registry
            .register(descriptor)
            .map_err(|e| (SynthesisStage::Register, e.to_string()))
    }
}
