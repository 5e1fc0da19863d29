// crates/core/src/generated_store.rs

//! On-disk store for synthesized capabilities.
//!
//! Layout:
//! ```text
//! <root>/
//!   Cargo.toml                 workspace, members crates/common + generated/*/*
//!   crates/common/             runtime support crate used by every capability
//!   generated/<namespace>/<name>/
//!     Cargo.toml
//!     meta.json
//!     src/lib.rs               generated `pub fn run`
//!     src/main.rs              fixed stdin/stdout template
//!     tests/self_test.rs       generated self-tests
//! ```
//!
//! Entries are append-only: once `active`, a directory is never rewritten.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::synthesizer::GeneratedCapability;
use crate::types::ParameterSpec;

pub const META_FILE: &str = "meta.json";
const GENERATED_DIR: &str = "generated";

const WORKSPACE_MANIFEST: &str = include_str!("../../../capabilities/Cargo.toml");
const COMMON_MANIFEST: &str = include_str!("../../../capabilities/crates/common/Cargo.toml");
const COMMON_LIB: &str = include_str!("../../../capabilities/crates/common/src/lib.rs");

/// Lifecycle of a stored entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    /// Written but not yet validated and loaded.
    #[default]
    Pending,
    /// Validated, loaded and registered at least once.
    Active,
}

/// On-disk representation of a generated capability's metadata.
///
/// This maps 1:1 to meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMeta {
    pub namespace: String,
    pub name: String,
    pub summary: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Cargo package name inside the store workspace.
    pub package: String,
    #[serde(default)]
    pub status: StoreStatus,
    pub created_at: DateTime<Utc>,
}

/// An entry read back from disk.
#[derive(Debug, Clone)]
pub struct StoredCapability {
    pub meta: CapabilityMeta,
    pub dir: PathBuf,
}

/// Cargo package name for a capability key.
///
/// Unambiguous only for segments accepted by [`is_package_segment`].
pub fn package_name(namespace: &str, name: &str) -> String {
    format!("cap_{}__{}", namespace, name)
}

/// True if `segment` can be a namespace or name of a generated capability:
/// a lowercase letter, then lowercase letters, digits and single `_`.
pub fn is_package_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !segment.contains("__")
}

/// Filesystem operations on the generated-capability store.
#[derive(Debug, Clone)]
pub struct GeneratedStore {
    root: PathBuf,
}

impl GeneratedStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn crate_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(GENERATED_DIR).join(namespace).join(name)
    }

    /// Where `cargo build --target wasm32-wasip1 --release` leaves a package.
    pub fn wasm_path(&self, package: &str) -> PathBuf {
        self.root
            .join("target")
            .join("wasm32-wasip1")
            .join("release")
            .join(format!("{}.wasm", package))
    }

    /// Write the workspace manifest and runtime crate when missing.
    pub fn ensure_workspace(&self) -> Result<()> {
        let files = [
            (self.root.join("Cargo.toml"), WORKSPACE_MANIFEST),
            (self.root.join("crates/common/Cargo.toml"), COMMON_MANIFEST),
            (self.root.join("crates/common/src/lib.rs"), COMMON_LIB),
        ];
        for (path, contents) in files {
            if path.exists() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::debug!(path = %path.display(), "scaffolded store file");
        }
        Ok(())
    }

    fn read_meta(&self, dir: &Path) -> Result<Option<CapabilityMeta>> {
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&meta_path)
            .with_context(|| format!("failed to read {:?}", meta_path))?;
        let meta = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {:?}", meta_path))?;
        Ok(Some(meta))
    }

    fn write_meta(&self, dir: &Path, meta: &CapabilityMeta) -> Result<()> {
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("failed to write meta.json in {}", dir.display()))
    }

    /// Write `artifact` as a pending crate, replacing an earlier pending one.
    ///
    /// Refuses to touch an active entry.
    pub fn stage(&self, artifact: &GeneratedCapability) -> Result<StoredCapability> {
        self.ensure_workspace()?;

        let dir = self.crate_dir(&artifact.namespace, &artifact.name);
        if let Some(existing) = self.read_meta(&dir)? {
            if existing.status == StoreStatus::Active {
                anyhow::bail!(
                    "generated capability '{}:{}' is already active at {}",
                    artifact.namespace,
                    artifact.name,
                    dir.display()
                );
            }
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear pending entry {}", dir.display()))?;
        }

        fs::create_dir_all(dir.join("src"))?;
        fs::create_dir_all(dir.join("tests"))?;

        let package = package_name(&artifact.namespace, &artifact.name);
        fs::write(dir.join("Cargo.toml"), crate_manifest(&package))?;
        fs::write(dir.join("src/lib.rs"), &artifact.source)?;
        fs::write(dir.join("src/main.rs"), main_template(&package))?;
        fs::write(dir.join("tests/self_test.rs"), &artifact.self_test)?;

        let meta = CapabilityMeta {
            namespace: artifact.namespace.clone(),
            name: artifact.name.clone(),
            summary: artifact.summary.clone(),
            parameters: artifact.parameters.clone(),
            package,
            status: StoreStatus::Pending,
            created_at: Utc::now(),
        };
        self.write_meta(&dir, &meta)?;

        tracing::debug!(dir = %dir.display(), "staged generated capability");
        Ok(StoredCapability { meta, dir })
    }

    /// Flip a staged entry to `active`.
    pub fn commit(&self, namespace: &str, name: &str) -> Result<()> {
        let dir = self.crate_dir(namespace, name);
        let mut meta = self
            .read_meta(&dir)?
            .with_context(|| format!("no staged capability at {}", dir.display()))?;
        if meta.status == StoreStatus::Active {
            return Ok(());
        }
        meta.status = StoreStatus::Active;
        self.write_meta(&dir, &meta)?;
        tracing::info!(key = %format!("{}:{}", namespace, name), "generated capability persisted");
        Ok(())
    }

    /// Remove a pending entry after a failed attempt. Active entries are kept.
    pub fn discard(&self, namespace: &str, name: &str) -> Result<()> {
        let dir = self.crate_dir(namespace, name);
        match self.read_meta(&dir)? {
            Some(meta) if meta.status == StoreStatus::Active => Ok(()),
            _ if dir.exists() => fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display())),
            _ => Ok(()),
        }
    }

    /// Every `active` entry, sorted by key. A missing store is empty.
    pub fn load_all(&self) -> Result<Vec<StoredCapability>> {
        let mut records = Vec::new();
        let generated = self.root.join(GENERATED_DIR);

        let namespaces = match fs::read_dir(&generated) {
            Ok(e) => e,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => {
                return Err(err).context(format!(
                    "failed to read generated capabilities at {:?}",
                    &generated
                ));
            }
        };

        for ns_entry in namespaces {
            let ns_dir = ns_entry?.path();
            if !ns_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&ns_dir)? {
                let dir = entry?.path();
                if !dir.is_dir() {
                    continue;
                }
                match self.read_meta(&dir)? {
                    Some(meta) if meta.status == StoreStatus::Active => {
                        records.push(StoredCapability { meta, dir })
                    }
                    Some(_) => tracing::debug!(dir = %dir.display(), "skipping pending entry"),
                    None => {}
                }
            }
        }

        records.sort_by(|a, b| {
            (&a.meta.namespace, &a.meta.name).cmp(&(&b.meta.namespace, &b.meta.name))
        });
        Ok(records)
    }
}

fn crate_manifest(package: &str) -> String {
    format!(
        r#"[package]
name = "{package}"
version = "0.1.0"
edition = "2021"

[dependencies]
capability_common.workspace = true
serde.workspace = true
serde_json.workspace = true
regex.workspace = true
chrono.workspace = true
"#,
        package = package
    )
}

fn main_template(package: &str) -> String {
    format!(
        r#"fn main() {{
    capability_common::serve({package}::run);
}}
"#,
        package = package
    )
}
