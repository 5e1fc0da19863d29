// crates/host/src/sandbox.rs

//! Cargo-backed sandbox: rustfmt for syntax, native `cargo test` for the
//! dry run, a wasm32-wasip1 release build for loading.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use nl_orchestrator_core::capability_runner::{CapabilityRunner, WasmCapability};
use nl_orchestrator_core::generated_store::{GeneratedStore, StoredCapability};
use nl_orchestrator_core::synthesizer::CapabilitySandbox;
use nl_orchestrator_core::types::{capability_key, CapabilityOrigin};
use nl_orchestrator_core::{CapabilityDescriptor, CapabilityHandler};

pub struct CargoSandbox {
    store: GeneratedStore,
    runner: Arc<CapabilityRunner>,
}

impl CargoSandbox {
    pub fn new(capabilities_root: impl Into<PathBuf>, runner: Arc<CapabilityRunner>) -> Self {
        Self {
            store: GeneratedStore::new(capabilities_root.into()),
            runner,
        }
    }

    fn workspace(&self) -> &Path {
        self.store.root()
    }

    /// Descriptor for a capability persisted by an earlier run.
    ///
    /// Reuses the compiled module when present, otherwise rebuilds it.
    pub fn reload(&self, stored: &StoredCapability) -> Result<CapabilityDescriptor> {
        let meta = &stored.meta;
        let wasm = self.store.wasm_path(&meta.package);
        let handler: Arc<dyn CapabilityHandler> = if wasm.exists() {
            let key = capability_key(&meta.namespace, &meta.name);
            Arc::new(WasmCapability::load(key, Arc::clone(&self.runner), &wasm)?)
        } else {
            self.load(&stored.dir, &meta.package)?
        };

        Ok(CapabilityDescriptor::new(
            meta.namespace.clone(),
            meta.name.clone(),
            meta.summary.clone(),
            handler,
        )
        .with_parameters(meta.parameters.clone())
        .with_origin(CapabilityOrigin::Generated))
    }
}

impl CapabilitySandbox for CargoSandbox {
    fn check_syntax(&self, source: &str) -> Result<()> {
        let mut child = Command::new("rustfmt")
            .args(["--edition", "2021", "--emit", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start rustfmt")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .context("failed to pipe source into rustfmt")?;
        }

        let output = child.wait_with_output().context("rustfmt did not finish")?;
        if !output.status.success() {
            bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    fn dry_run(&self, _crate_dir: &Path, package: &str) -> Result<String> {
        let output = Command::new("cargo")
            .args(["test", "-p", package, "--", "--nocapture"])
            .current_dir(self.workspace())
            .output()
            .context("failed to run cargo test")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(format!("Tests passed\n{}", stdout))
        } else {
            bail!("Tests failed!\n\nSTDOUT:\n{}\n\nSTDERR:\n{}", stdout, stderr)
        }
    }

    fn load(&self, _crate_dir: &Path, package: &str) -> Result<Arc<dyn CapabilityHandler>> {
        let output = Command::new("cargo")
            .args([
                "build",
                "--release",
                "--target",
                "wasm32-wasip1",
                "-p",
                package,
            ])
            .current_dir(self.workspace())
            .output()
            .context("failed to run cargo build")?;

        if !output.status.success() {
            bail!("Build failed:\n{}", String::from_utf8_lossy(&output.stderr));
        }

        let wasm = self.store.wasm_path(package);
        let capability = WasmCapability::load(package, Arc::clone(&self.runner), &wasm)
            .with_context(|| format!("failed to load {}", wasm.display()))?;
        tracing::info!(package = %package, wasm = %wasm.display(), "capability module loaded");
        Ok(Arc::new(capability))
    }
}
