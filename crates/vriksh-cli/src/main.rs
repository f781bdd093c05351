use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vriksh_engine::{
    default_registry, force_teardown, AutoFinish, Engine, ReadyGate, ReadySignal, RunContext,
    RunPhase,
};
use vriksh_scoring::HttpScorer;
use vriksh_store::Ledger;
use vriksh_substrate::DockerCli;

#[derive(Parser)]
#[command(name = "vriksh", version, about = "Declarative lab environment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a lab file against the schema and semantic rules
    Validate {
        lab: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Execute a lab end-to-end: provision, wait, score, tear down
    Run {
        lab: PathBuf,
        /// Skip the interactive wait and score immediately
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the event log of a run (most recent by default)
    Logs {
        #[arg(long = "id")]
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Force-stop a run's resources using ledger records alone
    Teardown {
        #[arg(long = "id")]
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Validate { lab, json } => {
            let spec = vriksh_spec::load(&lab)?;
            spec.validate_semantics()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "lab": {
                        "id": spec.metadata.id,
                        "title": spec.metadata.title,
                        "version": spec.metadata.version,
                        "providers": spec.spec.topology.providers.len(),
                        "tasks": spec.spec.tasks.len()
                    }
                })));
            }
            println!("lab: {}", spec.metadata.id);
            println!("title: {}", spec.metadata.title);
            println!("providers: {}", spec.spec.topology.providers.len());
            println!("tasks: {}", spec.spec.tasks.len());
            println!("status: valid");
        }
        Commands::Run { lab, no_wait, json } => {
            let ledger = open_ledger()?;
            let substrate = DockerCli::new();
            let scorer = HttpScorer::new(&ledger)?;
            let engine = Engine::new(&ledger, &substrate, &scorer, default_registry());

            let auto = AutoFinish;
            let stdin_gate = StdinGate;
            let gate: &dyn ReadyGate = if no_wait { &auto } else { &stdin_gate };

            let outcome = engine.execute(&lab, gate)?;
            let failed = outcome.status == RunPhase::Failed || outcome.error.is_some();
            if json {
                let payload = json!({
                    "ok": !failed,
                    "command": "run",
                    "run_id": outcome.run_id,
                    "status": outcome.status.as_str(),
                    "score": outcome.score,
                    "error": outcome.error
                });
                if failed {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            println!("run_id: {}", outcome.run_id);
            println!("status: {}", outcome.status.as_str());
            if let Some(score) = outcome.score {
                println!("score: {}", score);
            }
            if let Some(error) = outcome.error {
                anyhow::bail!("run finished with error: {}", error);
            }
        }
        Commands::Logs { run_id, json } => {
            let ledger = open_ledger()?;
            let run = match run_id {
                Some(id) => ledger
                    .get_run(&id)?
                    .with_context(|| format!("no run with id '{}'", id))?,
                None => ledger
                    .get_most_recent_run()?
                    .context("no runs recorded yet")?,
            };
            let events = ledger.list_events(&run.id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "logs",
                    "run_id": run.id,
                    "lab_id": run.lab_id,
                    "status": run.status,
                    "events": events.iter().map(|e| json!({
                        "seq": e.seq,
                        "timestamp": e.timestamp,
                        "type": e.event_type,
                        "message": e.message,
                        "payload": e.payload
                    })).collect::<Vec<_>>()
                })));
            }
            println!("run_id: {} (lab: {}, status: {})", run.id, run.lab_id, run.status);
            for event in &events {
                println!("{} [{}] {}", event.timestamp, event.event_type, event.message);
            }
        }
        Commands::Teardown { run_id, json } => {
            let ledger = open_ledger()?;
            let substrate = DockerCli::new();
            let report = force_teardown(&ledger, &substrate, run_id.as_deref())?;
            let ok = report.failed == 0;
            if json {
                let payload = json!({
                    "ok": ok,
                    "command": "teardown",
                    "run_id": report.run_id,
                    "stopped": report.stopped,
                    "failed": report.failed
                });
                if !ok {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            println!("run_id: {}", report.run_id);
            println!("stopped: {}", report.stopped);
            if !ok {
                anyhow::bail!("{} resource(s) failed to stop; see `vriksh logs`", report.failed);
            }
        }
    }
    Ok(None)
}

/// Blocks until the learner presses Enter, after printing where the lab is
/// reachable. EOF on stdin counts as an abort so piped invocations without
/// `--no-wait` still reach teardown instead of hanging.
struct StdinGate;

impl ReadyGate for StdinGate {
    fn wait(&self, ctx: &RunContext) -> ReadySignal {
        println!();
        println!("Lab is ready. Access info:");
        for (id, handle) in &ctx.provider_state {
            match serde_json::to_string_pretty(&handle.metadata) {
                Ok(pretty) => println!("  {}: {}", id, pretty),
                Err(_) => println!("  {}: <unprintable metadata>", id),
            }
        }
        println!();
        print!("Press Enter to finish the lab and run scoring... ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => ReadySignal::Abort("stdin closed while waiting".to_string()),
            Ok(_) => ReadySignal::Finished,
            Err(e) => ReadySignal::Abort(format!("stdin read failed: {}", e)),
        }
    }
}

fn open_ledger() -> Result<Ledger> {
    let path = Ledger::default_path()?;
    Ok(Ledger::open(&path)?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Validate { json, .. }
        | Commands::Run { json, .. }
        | Commands::Logs { json, .. }
        | Commands::Teardown { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn binary_version_tracks_the_package() {
        let command = Cli::command();
        assert_eq!(command.get_version(), Some(env!("CARGO_PKG_VERSION")));
    }
}
