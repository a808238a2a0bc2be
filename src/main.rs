use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use docpipe_lib::config::{self, Settings};
use docpipe_lib::core_state::CoreState;
use docpipe_lib::db;
use docpipe_lib::pipeline::llm::{LlmClient, OllamaClient};
use docpipe_lib::pipeline::ocr::{EngineRegistry, HttpOcrEngine, PlainTextOcr};
use docpipe_lib::pipeline::push::DeliveryOutcome;
use docpipe_lib::pipeline::review::ReviewDecision;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "docpipe", version = config::APP_VERSION)]
#[command(about = "Turns uploaded documents into validated, structured results and delivers them downstream")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run queue workers until Ctrl-C
    Worker {
        /// Overrides DOCPIPE_WORKERS
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Upload a file for processing under a rule version
    Submit {
        file: PathBuf,
        #[arg(long)]
        rule: String,
        #[arg(long)]
        version: u32,
    },
    /// Show a task with its timeline
    Status { task_id: Uuid },
    /// List every push attempt recorded for a task
    Attempts { task_id: Uuid },
    /// List dead-lettered deliveries
    DeadLetters,
    /// Redeliver a dead letter with the current target configuration
    RetryDeadLetter { id: Uuid },
    /// Decide a task waiting in review
    Review {
        task_id: Uuid,
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Field correction as `path=<json value>`; repeatable
        #[arg(long = "set", requires = "approve")]
        corrections: Vec<String>,
        #[arg(long)]
        reject: Option<String>,
    },
}

fn main() -> ExitCode {
    docpipe_lib::init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult {
    let mut settings = Settings::load()?;
    if let Command::Worker { workers: Some(n) } = &cli.command {
        settings.workers = *n;
    }

    // Blocking HTTP clients must exist outside the async runtime
    let engines = ocr_engines(&settings)?;
    let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(&settings.llm_url, 120)?);
    let core = CoreState::open(settings, engines, Some(llm))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(&core, cli.command))
}

fn ocr_engines(settings: &Settings) -> Result<EngineRegistry, Box<dyn std::error::Error>> {
    let mut engines = EngineRegistry::new().with("text", Arc::new(PlainTextOcr));
    match &settings.ocr_url {
        Some(url) => {
            let http = Arc::new(HttpOcrEngine::new("http", url, Duration::from_secs(120))?);
            engines.register("http", http.clone());
            engines.register("default", http);
        }
        None => engines.register("default", Arc::new(PlainTextOcr)),
    }
    Ok(engines)
}

async fn execute(core: &CoreState, command: Command) -> CliResult {
    match command {
        Command::Worker { .. } => {
            let handle = core.worker_pool().start();
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");
            handle.shutdown().await;
        }
        Command::Submit { file, rule, version } => {
            let bytes = std::fs::read(&file)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let resolution = core.dedup.resolve(&bytes, &name, &rule, version)?;
            let task = resolution.task();
            print_json(&json!({
                "task_id": task.id,
                "state": task.state,
                "instant": resolution.is_instant(),
                "fingerprint": task.fingerprint,
                "result": if resolution.is_instant() { task.result_json() } else { Value::Null },
            }))?;
        }
        Command::Status { task_id } => {
            let task = core.db.with(|conn| db::require_task(conn, &task_id))?;
            print_json(&json!({
                "task": task,
                "result": task.result_json(),
                "confidence": task.overall_confidence(),
                "timeline": task.timeline(),
            }))?;
        }
        Command::Attempts { task_id } => {
            print_json(&serde_json::to_value(core.dispatcher.attempts(task_id)?)?)?;
        }
        Command::DeadLetters => {
            print_json(&serde_json::to_value(core.dispatcher.dead_letters()?)?)?;
        }
        Command::RetryDeadLetter { id } => {
            let outcome = core.dispatcher.retry_dead_letter(id).await?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Review {
            task_id,
            approve,
            corrections,
            reject,
        } => {
            let decision = match (approve, reject) {
                (true, _) => ReviewDecision::Approve {
                    corrections: parse_corrections(&corrections)?,
                },
                (false, Some(reason)) => ReviewDecision::Reject { reason },
                (false, None) => return Err("pass --approve or --reject <reason>".into()),
            };
            let outcome = core.review.decide(task_id, decision).await?;
            print_json(&json!({
                "task_id": outcome.task.id,
                "state": outcome.task.state,
                "deliveries": outcome.deliveries.iter().map(outcome_json).collect::<Vec<_>>(),
            }))?;
        }
    }
    Ok(())
}

/// `path=value` pairs; the value is JSON when it parses, a string otherwise.
fn parse_corrections(raw: &[String]) -> Result<BTreeMap<String, Value>, Box<dyn std::error::Error>> {
    let mut out = BTreeMap::new();
    for item in raw {
        let (path, value) = item
            .split_once('=')
            .ok_or_else(|| format!("correction '{item}' is not path=value"))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        out.insert(path.trim().to_string(), value);
    }
    Ok(out)
}

fn outcome_json(outcome: &DeliveryOutcome) -> Value {
    json!({
        "target_id": outcome.target_id,
        "attempt": outcome.attempt,
        "success": outcome.success,
        "status_code": outcome.status_code,
        "error": outcome.error,
        "next_retry_secs": outcome.next_retry.map(|d| d.as_secs()),
        "dead_lettered": outcome.dead_lettered,
    })
}

fn print_json(value: &Value) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
