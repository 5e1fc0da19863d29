// crates/core/src/config.rs

//! Orchestrator configuration: TOML file first, environment overrides on top.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "orchestrator.toml";

/// Header style used to authenticate against a chat backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    /// `Authorization: Bearer <key>` against `/v1/chat/completions`.
    #[default]
    OpenAi,
    /// `api-key: <key>` against an Azure deployment URL.
    Azure,
}

/// One LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
    pub model: String,
    /// Never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_style: ApiStyle,
    pub max_tokens: u32,
    /// Transport-level timeout; the orchestrator applies its own deadline too.
    pub request_timeout_secs: u64,
}

impl BackendConfig {
    fn local_default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            api_style: ApiStyle::OpenAi,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }

    fn remote_default() -> Self {
        Self {
            endpoint: "https://api.openai.com".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            api_style: ApiStyle::OpenAi,
            max_tokens: 8000,
            request_timeout_secs: 180,
        }
    }

    fn apply_env(&mut self, prefix: &str) {
        if let Some(v) = env_var(&format!("{}_ENDPOINT", prefix)) {
            self.endpoint = v;
        }
        if let Some(v) = env_var(&format!("{}_MODEL", prefix)) {
            self.model = v;
        }
        if let Some(v) = env_var(&format!("{}_API_KEY", prefix)) {
            self.api_key = Some(v);
        }
        if let Some(v) = env_var(&format!("{}_API_STYLE", prefix)) {
            self.api_style = match v.to_ascii_lowercase().as_str() {
                "azure" => ApiStyle::Azure,
                _ => ApiStyle::OpenAi,
            };
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::local_default()
    }
}

/// Per-component LLM deadlines, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub safety_secs: u64,
    pub classifier_secs: u64,
    pub planner_secs: u64,
    pub elaboration_secs: u64,
    pub synthesis_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            safety_secs: 10,
            classifier_secs: 30,
            planner_secs: 30,
            elaboration_secs: 60,
            synthesis_secs: 240,
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root of the generated-capability store.
    pub capabilities_root: PathBuf,
    /// Hard ceiling on planning iterations per instruction.
    pub max_iterations: usize,
    /// Synthesis attempts allowed per `namespace:name` per process.
    pub synthesis_max_attempts: u32,
    /// Run chains the planner marks independent on scoped threads.
    pub concurrent_chains: bool,
    /// Fallback log level when `RUST_LOG` is unset.
    pub log_level: String,
    pub timeouts: TimeoutConfig,
    /// Local, low-latency backend for safety, classification, planning and
    /// elaboration.
    pub classifier: BackendConfig,
    /// Remote code-generation backend for synthesis.
    pub codegen: BackendConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capabilities_root: PathBuf::from("capabilities"),
            max_iterations: 24,
            synthesis_max_attempts: 2,
            concurrent_chains: false,
            log_level: "info".to_string(),
            timeouts: TimeoutConfig::default(),
            classifier: BackendConfig::local_default(),
            codegen: BackendConfig::remote_default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path` when it exists, otherwise start from defaults, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_var("ORCHESTRATOR_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_var("ORCHESTRATOR_CAPABILITIES_ROOT") {
            self.capabilities_root = PathBuf::from(v);
        }
        if let Some(v) = env_var("ORCHESTRATOR_MAX_ITERATIONS").and_then(|s| s.parse().ok()) {
            self.max_iterations = v;
        }
        if let Some(v) = env_var("ORCHESTRATOR_SYNTHESIS_ATTEMPTS").and_then(|s| s.parse().ok()) {
            self.synthesis_max_attempts = v;
        }
        if let Some(v) = env_var("ORCHESTRATOR_LOG_LEVEL") {
            self.log_level = v;
        }
        self.classifier.apply_env("CLASSIFIER");
        self.codegen.apply_env("CODEGEN");
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be greater than 0");
        }
        if self.synthesis_max_attempts == 0 {
            anyhow::bail!("synthesis_max_attempts must be greater than 0");
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("timeouts.safety_secs", t.safety_secs),
            ("timeouts.classifier_secs", t.classifier_secs),
            ("timeouts.planner_secs", t.planner_secs),
            ("timeouts.elaboration_secs", t.elaboration_secs),
            ("timeouts.synthesis_secs", t.synthesis_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }
        for (name, backend) in [("classifier", &self.classifier), ("codegen", &self.codegen)] {
            if backend.endpoint.trim().is_empty() {
                anyhow::bail!("{}.endpoint must not be empty", name);
            }
            if backend.model.trim().is_empty() {
                anyhow::bail!("{}.model must not be empty", name);
            }
        }
        Ok(())
    }
}

impl TimeoutConfig {
    pub fn safety(&self) -> Duration {
        Duration::from_secs(self.safety_secs)
    }

    pub fn classifier(&self) -> Duration {
        Duration::from_secs(self.classifier_secs)
    }

    pub fn planner(&self) -> Duration {
        Duration::from_secs(self.planner_secs)
    }

    pub fn elaboration(&self) -> Duration {
        Duration::from_secs(self.elaboration_secs)
    }

    pub fn synthesis(&self) -> Duration {
        Duration::from_secs(self.synthesis_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
