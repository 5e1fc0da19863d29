// crates/core/src/synthesizer/validation.rs

//! Checks a generated capability must pass before it is loaded.
//!
//! Order: syntax (sandbox) -> static import/name check -> dry run of the
//! self-tests (sandbox). The dry run needs the crate on disk, so the
//! synthesizer stages it between the two halves.

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{GeneratedCapability, SynthesisStage};
use crate::capability_registry::CapabilityRegistry;
use crate::types::CapabilityHandler;

/// Toolchain seam used to validate and load generated code.
pub trait CapabilitySandbox: Send + Sync {
    /// Fail when `source` is not syntactically valid Rust.
    fn check_syntax(&self, source: &str) -> anyhow::Result<()>;

    /// Run the crate's self-tests in isolation and return their output.
    fn dry_run(&self, crate_dir: &Path, package: &str) -> anyhow::Result<String>;

    /// Build the crate and return a handler that invokes it.
    fn load(&self, crate_dir: &Path, package: &str) -> anyhow::Result<Arc<dyn CapabilityHandler>>;
}

/// Crate roots generated code may name.
const ALLOWED_ROOTS: &[&str] = &[
    "std", "core", "alloc", "crate", "self", "super", "serde", "serde_json", "capability_common",
    "regex", "chrono",
    // primitive types with associated items
    "str", "char", "bool", "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64",
    "u128", "usize", "f32", "f64",
];

static NON_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"(?:\\.|[^"\\])*"|//[^\n]*|/\*.*?\*/"#).expect("non-code pattern is valid")
});
static UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bunsafe\b").expect("unsafe pattern is valid"));
static FORBIDDEN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:std|core)\s*::\s*(fs|process|net|os|env)\b").expect("forbidden path pattern is valid")
});
static FORBIDDEN_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bextern\b|#\s*!?\[\s*link|\binclude(?:_str|_bytes)?\s*!")
        .expect("forbidden item pattern is valid")
});
static USE_STMT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\buse\s+([^;]+);").expect("use pattern is valid"));
static STD_MODULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(fs|process|net|os|env)\b").expect("module pattern is valid"));
static PATH_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\w:.])([a-z_][a-z0-9_]*)\s*::\s*[A-Za-z_{*]")
        .expect("path root pattern is valid")
});
static LOCAL_MOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bmod\s+([a-z_][a-z0-9_]*)").expect("mod pattern is valid"));
static RUN_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bpub\s+fn\s+run\s*\(").expect("entry pattern is valid"));

/// Blank out comments and string literals so prose cannot trip the checks.
fn code_only(source: &str) -> String {
    NON_CODE
        .replace_all(source, |caps: &regex::Captures<'_>| {
            if caps[0].starts_with('"') {
                "\"\""
            } else {
                " "
            }
        })
        .into_owned()
}

/// Scan `source` for forbidden APIs and crates outside the allowlist.
///
/// `extra_roots` are additional crate names accepted (the package itself, for
/// self-tests).
pub fn check_imports(source: &str, extra_roots: &[&str]) -> Result<(), String> {
    let code = code_only(source);

    if UNSAFE.is_match(&code) {
        return Err("`unsafe` is not allowed".to_string());
    }
    if let Some(m) = FORBIDDEN_PATH.find(&code) {
        return Err(format!("`{}` is not allowed (no fs, process, network or env access)", m.as_str()));
    }
    if let Some(m) = FORBIDDEN_ITEM.find(&code) {
        return Err(format!("`{}` is not allowed", m.as_str().trim()));
    }

    for caps in USE_STMT.captures_iter(&code) {
        let path = caps[1].trim().trim_start_matches("::");
        let root = path
            .split(|c: char| c == ':' || c == '{' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        if matches!(root, "std" | "core") {
            if let Some(m) = STD_MODULE.find(path) {
                return Err(format!(
                    "`use {}` imports std::{} which is not allowed",
                    path,
                    m.as_str()
                ));
            }
        }
    }

    let local_mods: Vec<&str> = LOCAL_MOD
        .captures_iter(&code)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    for caps in PATH_ROOT.captures_iter(&code) {
        let root = &caps[1];
        let allowed = ALLOWED_ROOTS.contains(&root)
            || extra_roots.contains(&root)
            || local_mods.contains(&root);
        if !allowed {
            return Err(format!(
                "crate `{}` is not available; allowed crates: serde, serde_json, regex, chrono, capability_common",
                root
            ));
        }
    }

    Ok(())
}

/// Full static check of a generated artifact.
pub fn static_check(
    artifact: &GeneratedCapability,
    package: &str,
    already_registered: bool,
) -> Result<(), String> {
    if already_registered {
        return Err(format!(
            "'{}:{}' is already registered",
            artifact.namespace, artifact.name
        ));
    }
    let mut seen = Vec::new();
    for param in &artifact.parameters {
        if !crate::command::is_identifier(&param.name) {
            return Err(format!("parameter name '{}' is not an identifier", param.name));
        }
        if seen.contains(&param.name.as_str()) {
            return Err(format!("parameter '{}' is declared twice", param.name));
        }
        seen.push(param.name.as_str());
    }
    if !RUN_ENTRY.is_match(&code_only(&artifact.source)) {
        return Err("missing entry point `pub fn run(args: &serde_json::Value) -> Result<String, String>`".to_string());
    }
    check_imports(&artifact.source, &[]).map_err(|e| format!("src/lib.rs: {}", e))?;
    check_imports(&artifact.self_test, &[package]).map_err(|e| format!("tests/self_test.rs: {}", e))?;
    Ok(())
}

/// Runs the source-level checks that do not need the crate on disk.
pub struct ValidationPipeline {
    sandbox: Arc<dyn CapabilitySandbox>,
    registry: Arc<CapabilityRegistry>,
}

impl ValidationPipeline {
    pub fn new(sandbox: Arc<dyn CapabilitySandbox>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { sandbox, registry }
    }

    /// Syntax check followed by the static check.
    pub fn check_source(
        &self,
        artifact: &GeneratedCapability,
        package: &str,
    ) -> Result<(), (SynthesisStage, String)> {
        self.sandbox
            .check_syntax(&artifact.source)
            .map_err(|e| (SynthesisStage::Syntax, format!("src/lib.rs: {:#}", e)))?;
        self.sandbox
            .check_syntax(&artifact.self_test)
            .map_err(|e| (SynthesisStage::Syntax, format!("tests/self_test.rs: {:#}", e)))?;

        let registered = self.registry.contains(&artifact.namespace, &artifact.name);
        static_check(artifact, package, registered).map_err(|e| (SynthesisStage::StaticCheck, e))
    }

    /// Run the self-tests of a staged crate.
    pub fn dry_run(&self, crate_dir: &Path, package: &str) -> Result<String, (SynthesisStage, String)> {
        self.sandbox
            .dry_run(crate_dir, package)
            .map_err(|e| (SynthesisStage::DryRun, format!("{:#}", e)))
    }

    pub fn sandbox(&self) -> &Arc<dyn CapabilitySandbox> {
        &self.sandbox
    }
}
