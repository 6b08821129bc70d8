mod cli;
mod gateway;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use cli::{Cli, Commands};
use forma_agent::{Orchestrator, PipelineOutcome, PipelineRequest, TerminalEventSink};
use forma_core::config::{LlmConfig, PipelineSettings, ServerConfig};
use forma_core::observability::{init_tracing, TracingMode};
use forma_executor::TaskStore;
use forma_sandbox::{validate_code, SandboxConfig, SandboxExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Commands::Serve { .. } => TracingMode::Server,
        _ => TracingMode::Cli,
    };
    init_tracing(mode);

    match cli.command {
        Commands::Serve { bind } => serve(bind).await,
        Commands::Run {
            prompt,
            session,
            max_iterations,
            verbose,
        } => run(&prompt, session, max_iterations, verbose).await,
        Commands::Validate { file } => validate(&file),
        Commands::Exec {
            file,
            task_id,
            timeout,
            max_memory,
        } => exec(&file, &task_id, timeout, max_memory).await,
    }
}

async fn serve(bind: Option<String>) -> Result<()> {
    let mut server = ServerConfig::from_env();
    if let Some(bind) = bind {
        server.bind_addr = bind;
    }
    let sandbox = SandboxExecutor::new(SandboxConfig::from_env()?);
    let output_dir = sandbox.output_dir().to_path_buf();
    let orchestrator = Orchestrator::with_llm(&LlmConfig::from_env(), sandbox, PipelineSettings::from_env())?;

    let state = gateway::AppState {
        store: TaskStore::new(),
        orchestrator: Arc::new(orchestrator),
        server: Arc::new(server),
    };
    gateway::serve(state, &output_dir).await
}

async fn run(
    prompt: &str,
    session: Option<String>,
    max_iterations: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let mut settings = PipelineSettings::from_env();
    if let Some(n) = max_iterations {
        settings.max_iterations = n.max(1);
    }
    let sandbox = SandboxExecutor::new(SandboxConfig::from_env()?);
    let orchestrator = Orchestrator::with_llm(&LlmConfig::from_env(), sandbox, settings)?;

    let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let task_id = uuid::Uuid::new_v4().to_string();
    let request = PipelineRequest::new(prompt, &session, &task_id);
    let mut sink = TerminalEventSink::new(verbose);

    match orchestrator.run(&request, &mut sink).await? {
        PipelineOutcome::Approved { model, preview, .. } => {
            println!("STL:     {}", model.mesh.display());
            if let Some(brep) = &model.brep {
                println!("STEP:    {}", brep.display());
            }
            println!("Preview: {}", preview.display());
            Ok(())
        }
        PipelineOutcome::Exhausted { iterations, .. } => {
            anyhow::bail!("no approved model after {} iteration(s)", iterations)
        }
    }
}

fn validate(file: &Path) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    match validate_code(&code) {
        Ok(()) => {
            println!("OK: {}", file.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn exec(file: &Path, task_id: &str, timeout: Option<u64>, max_memory: Option<u64>) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut config = SandboxConfig::from_env()?;
    if let Some(t) = timeout {
        config.exec_limits.timeout_secs = t;
    }
    if let Some(m) = max_memory {
        config.exec_limits.max_memory_mb = m;
    }

    match SandboxExecutor::new(config).execute(&code, task_id).await {
        Ok(model) => {
            let files: serde_json::Map<String, serde_json::Value> = model
                .files()
                .into_iter()
                .map(|(kind, path)| (kind.to_string(), json!(path.display().to_string())))
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "success": true, "files": files }))?);
            Ok(())
        }
        Err(e) => {
            let out = json!({
                "success": false,
                "category": e.category().as_str(),
                "error": e.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            std::process::exit(1);
        }
    }
}
