// crates/core/src/lib.rs

pub mod ai_client;
pub mod capability_registry;
pub mod capability_runner;
pub mod classifier;
pub mod command;
pub mod config;
pub mod error;
pub mod generated_store;
pub mod http_client;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod prompt_utils;
pub mod safety;
pub mod synthesizer;
pub mod types;

pub use capability_registry::{CapabilityRegistry, ChainMode, InvocationOutcome};
pub use config::OrchestratorConfig;
pub use error::{ErrorKind, ErrorReport, OrchestratorError};
pub use orchestrator::{CancellationFlag, InstructionReport, Orchestrator, Outcome, StepReport, StepStatus};
pub use types::{handler_fn, ArgMap, CapabilityDescriptor, CapabilityHandler, ParamType, ParameterSpec};
