// crates/core/src/capability_runner.rs

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use wasmtime::{Caller, Engine, Linker, Module, Store};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::types::{ArgMap, CapabilityHandler, HandlerContext};

/// Stdout captured per run (1MB).
const STDOUT_CAPACITY: usize = 1024 * 1024;
/// Stderr captured per run (64KB).
const STDERR_CAPACITY: usize = 64 * 1024;

/// Runs WASM capabilities using Wasmtime with WASI + custom host functions.
///
/// Contract:
/// - Capabilities are .wasm modules compiled for wasm32-wasip1
/// - Arguments are passed as a JSON object on stdin
/// - The textual result is captured from stdout
/// - A non-zero exit code is a failure; stderr carries the message
/// - Host functions provide: HTTP GET and current time
#[derive(Clone, Default)]
pub struct CapabilityRunner {
    engine: Engine,
}

impl CapabilityRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a module from a `.wasm` file.
    pub fn compile_file(&self, wasm_path: &Path) -> Result<Module> {
        if !wasm_path.exists() {
            anyhow::bail!("capability WASM not found at {:?}", wasm_path);
        }
        Module::from_file(&self.engine, wasm_path)
            .with_context(|| format!("failed to compile WASM module {:?}", wasm_path))
    }

    /// Compile a module from binary or text format.
    pub fn compile_bytes(&self, bytes: impl AsRef<[u8]>) -> Result<Module> {
        Module::new(&self.engine, bytes).context("failed to compile WASM module")
    }

    pub fn run_module(&self, module: &Module, label: &str, input_json: &str) -> Result<String> {
        // Set up stdin/stdout/stderr capture
        let stdin_data: bytes::Bytes = input_json.as_bytes().to_vec().into();
        let stdout_pipe = MemoryOutputPipe::new(STDOUT_CAPACITY);
        let stderr_pipe = MemoryOutputPipe::new(STDERR_CAPACITY);

        let wasi_ctx = WasiCtxBuilder::new()
            .stdin(MemoryInputPipe::new(stdin_data))
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone())
            .build_p1();

        let mut store = Store::new(&self.engine, wasi_ctx);

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |cx| cx)?;
        Self::add_host_functions(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, module)
            .context("failed to instantiate WASM module")?;

        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .context("WASM module missing _start function")?;

        let result = start.call(&mut store, ());

        // Drop the store to release the pipes
        drop(store);

        let stdout_bytes = stdout_pipe.try_into_inner().unwrap_or_default();
        let stderr_bytes = stderr_pipe.try_into_inner().unwrap_or_default();

        let stdout = String::from_utf8(stdout_bytes.to_vec())
            .context("capability stdout was not valid UTF-8")?;
        let stderr = String::from_utf8_lossy(&stderr_bytes).trim().to_string();

        match result {
            Ok(()) => Ok(stdout),
            Err(e) => {
                // proc_exit(0) surfaces as an error too
                if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    if exit.0 == 0 {
                        return Ok(stdout);
                    }
                    anyhow::bail!("{} exited with code {}: {}", label, exit.0, stderr);
                }
                anyhow::bail!("{} failed: {}: {}", label, e, stderr)
            }
        }
    }

    /// Add custom host functions that capabilities can call.
    fn add_host_functions(linker: &mut Linker<WasiP1Ctx>) -> Result<()> {
        // host::http_get(url_ptr, url_len, result_ptr, result_cap) -> i32
        // Returns: length of response body written to result_ptr, or negative on error
        linker.func_wrap(
            "host",
            "http_get",
            |mut caller: Caller<'_, WasiP1Ctx>,
             url_ptr: i32,
             url_len: i32,
             result_ptr: i32,
             result_cap: i32|
             -> i32 {
                let memory = match caller.get_export("memory") {
                    Some(wasmtime::Extern::Memory(m)) => m,
                    _ => return -1,
                };

                let url_bytes = {
                    let data = memory.data(&caller);
                    let start = url_ptr as usize;
                    let end = start + url_len as usize;
                    if end > data.len() {
                        return -2;
                    }
                    data[start..end].to_vec()
                };

                let url = match String::from_utf8(url_bytes) {
                    Ok(s) => s,
                    Err(_) => return -3,
                };

                tracing::debug!(url = %url, "capability http_get");

                let response = match reqwest::blocking::get(&url) {
                    Ok(r) => r,
                    Err(_) => return -4,
                };

                let body = match response.text() {
                    Ok(b) => b,
                    Err(_) => return -5,
                };

                let body_bytes = body.as_bytes();
                if body_bytes.len() > result_cap.max(0) as usize {
                    return -6;
                }

                let data = memory.data_mut(&mut caller);
                let start = result_ptr as usize;
                let end = start + body_bytes.len();
                if end > data.len() {
                    return -6;
                }
                data[start..end].copy_from_slice(body_bytes);

                body_bytes.len() as i32
            },
        )?;

        // host::current_time_millis() -> i64
        linker.func_wrap("host", "current_time_millis", || -> i64 {
            chrono::Utc::now().timestamp_millis()
        })?;

        // host::current_time_secs() -> i64
        linker.func_wrap("host", "current_time_secs", || -> i64 {
            chrono::Utc::now().timestamp()
        })?;

        Ok(())
    }
}

/// Handler backed by a compiled WASM capability.
pub struct WasmCapability {
    key: String,
    runner: Arc<CapabilityRunner>,
    module: Module,
}

impl WasmCapability {
    pub fn new(key: impl Into<String>, runner: Arc<CapabilityRunner>, module: Module) -> Self {
        Self {
            key: key.into(),
            runner,
            module,
        }
    }

    /// Compile `wasm_path` and wrap it as a handler.
    pub fn load(key: impl Into<String>, runner: Arc<CapabilityRunner>, wasm_path: &Path) -> Result<Self> {
        let module = runner.compile_file(wasm_path)?;
        Ok(Self::new(key, runner, module))
    }
}

impl CapabilityHandler for WasmCapability {
    fn call(&self, _ctx: &mut HandlerContext<'_>, args: &ArgMap) -> Result<String> {
        let input = serde_json::to_string(args)?;
        let output = self.runner.run_module(&self.module, &self.key, &input)?;
        Ok(output.trim_end().to_string())
    }
}
