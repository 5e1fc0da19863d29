mod log;
mod manifest;
mod sandbox;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nl_orchestrator_core::ai_client::AiClient;
use nl_orchestrator_core::capability_runner::CapabilityRunner;
use nl_orchestrator_core::http_client::ChatCompletionsClient;
use nl_orchestrator_core::synthesizer::CapabilitySandbox;
use nl_orchestrator_core::{CapabilityRegistry, Orchestrator, OrchestratorConfig};

use sandbox::CargoSandbox;

/// Natural-language command orchestrator.
#[derive(Parser, Debug)]
#[command(name = "nl-orchestrator", version)]
struct Args {
    /// Configuration file (defaults to `$ORCHESTRATOR_CONFIG` or `orchestrator.toml`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print reports as JSON instead of colored text.
    #[arg(long)]
    json: bool,

    /// Instruction to run once; starts the REPL when omitted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    instruction: Vec<String>,
}

fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = OrchestratorConfig::load(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let classifier: Arc<dyn AiClient> = Arc::new(ChatCompletionsClient::new(&config.classifier)?);
    let codegen: Arc<dyn AiClient> = Arc::new(ChatCompletionsClient::new(&config.codegen)?);

    let runner = Arc::new(CapabilityRunner::new());
    let sandbox = Arc::new(CargoSandbox::new(&config.capabilities_root, runner));

    let registry = Arc::new(CapabilityRegistry::from_descriptors(
        manifest::builtin_capabilities(),
    )?);

    let orchestrator = Orchestrator::new(
        &config,
        Arc::clone(&registry),
        classifier,
        codegen,
        Arc::clone(&sandbox) as Arc<dyn CapabilitySandbox>,
    );
    reload_generated(&orchestrator, &sandbox)?;

    if !args.instruction.is_empty() {
        serve(&orchestrator, &args.instruction.join(" "), args.json)?;
        return Ok(());
    }

    log::banner(registry.len(), &registry.list_categories());

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let instruction = input.trim();

        if instruction.is_empty() {
            continue;
        }
        if instruction.eq_ignore_ascii_case("quit") || instruction.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        orchestrator.cancellation().reset();
        serve(&orchestrator, instruction, args.json)?;
        println!();
    }

    Ok(())
}

/// Register every active capability persisted by earlier runs.
fn reload_generated(orchestrator: &Orchestrator, sandbox: &CargoSandbox) -> Result<()> {
    let store = orchestrator.synthesizer().store();
    let stored = store
        .load_all()
        .with_context(|| format!("failed to read {}", store.root().display()))?;

    for entry in &stored {
        let key = format!("{}:{}", entry.meta.namespace, entry.meta.name);
        match sandbox
            .reload(entry)
            .and_then(|d| orchestrator.registry().register(d).map_err(Into::into))
        {
            Ok(_) => tracing::debug!(key = %key, "generated capability restored"),
            Err(e) => log::warn(format!("skipping generated capability {}: {:#}", key, e)),
        }
    }
    if !stored.is_empty() {
        log::info(format!("restored {} generated capabilities", stored.len()));
    }
    Ok(())
}

fn serve(orchestrator: &Orchestrator, instruction: &str, json: bool) -> Result<()> {
    match orchestrator.run(instruction) {
        Ok(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Ok(report) => log::report(&report),
        Err(e) if json => {
            let body = serde_json::json!({
                "error": e.report(),
                "completed": e.completed_steps(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?)
        }
        Err(e) => {
            log::steps(e.completed_steps());
            log::error(&e.report());
        }
    }
    Ok(())
}
