use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simlab_batch::{
    BatchOrchestrator, BatchState, ExperimentConfig, HarnessExecutor, RunProgress,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "simlab", version, about = "Batch experiment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute (or resume) a batch described by a config file.
    Run {
        config: PathBuf,
        /// Pick up from the checkpoint in the configured output dir.
        #[arg(long)]
        resume: bool,
        /// Print the batch plan without executing anything.
        #[arg(long)]
        dry_run: bool,
        /// Suppress per-run progress lines.
        #[arg(long)]
        no_progress: bool,
        #[arg(long)]
        json: bool,
    },
    /// Validate a config and show the resulting batch shape.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List every variation the config's dimensions generate.
    Variations {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command).await {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

async fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            resume,
            dry_run,
            no_progress,
            json,
        } => {
            let config = ExperimentConfig::load(&config)?;
            let executor = Arc::new(HarnessExecutor::new(config.harness_command.clone())?);
            let mut orchestrator = if resume {
                BatchOrchestrator::resume(config, executor)?
            } else {
                BatchOrchestrator::new(config, executor)?
            };

            if dry_run {
                let plan = orchestrator.plan();
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "dry_run": true,
                        "plan": serde_json::to_value(&plan)?
                    })));
                }
                print_plan(&plan);
                return Ok(None);
            }

            if !no_progress && !json {
                orchestrator.set_progress(Box::new(print_progress));
            }
            let summary = orchestrator.run().await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "resume": resume,
                    "summary": serde_json::to_value(&summary)?
                })));
            }
            println!("{}", summary.preview());
            if summary.state == BatchState::PausedBudget {
                println!("resume with a higher budget_limit to continue");
            }
            Ok(None)
        }
        Commands::Describe { config, json } => {
            let config = ExperimentConfig::load(&config)?;
            let variation_count = simlab_batch::variations::count(&config.variations);
            let total_runs = variation_count * config.runs_per_variation as usize;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "experiment": config.name,
                    "scenario": config.scenario_path,
                    "output_dir": config.output_dir,
                    "variation_count": variation_count,
                    "runs_per_variation": config.runs_per_variation,
                    "total_runs": total_runs,
                    "max_parallel": config.max_parallel,
                    "budget_limit": config.budget_limit,
                    "cost_per_run_limit": config.cost_per_run_limit
                })));
            }
            println!("experiment: {}", config.name);
            println!("scenario: {}", config.scenario_path.display());
            println!("output_dir: {}", config.output_dir.display());
            println!(
                "runs: {} variations x {} runs = {} total (max_parallel {})",
                variation_count, config.runs_per_variation, total_runs, config.max_parallel
            );
            if let Some(limit) = config.budget_limit {
                println!("budget_limit: {:.2}", limit);
            }
            if let Some(limit) = config.cost_per_run_limit {
                println!("cost_per_run_limit: {:.2}", limit);
            }
            Ok(None)
        }
        Commands::Variations { config, json } => {
            let config = ExperimentConfig::load(&config)?;
            let variations = simlab_batch::variations::generate(&config.variations);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "variations",
                    "count": variations.len(),
                    "variations": serde_json::to_value(&variations)?
                })));
            }
            for variation in &variations {
                println!("{}  {}", variation.label(), variation.description);
            }
            Ok(None)
        }
    }
}

fn print_progress(progress: &RunProgress) {
    println!(
        "{} {:?} cost={:.4}",
        progress.run_id, progress.status, progress.cost
    );
}

fn print_plan(plan: &simlab_batch::BatchPlan) {
    println!("experiment: {}", plan.experiment_name);
    println!(
        "runs: {} variations x {} runs = {} total, {} already completed, {} remaining",
        plan.variation_count,
        plan.runs_per_variation,
        plan.total_runs,
        plan.already_completed,
        plan.remaining_runs
    );
    println!("max_parallel: {}", plan.max_parallel);
    if let Some(limit) = plan.budget_limit {
        println!("budget_limit: {:.2}", limit);
    }
    if let Some(limit) = plan.cost_per_run_limit {
        println!("cost_per_run_limit: {:.2}", limit);
    }
    if let Some(spend) = plan.projected_max_spend {
        println!("projected_max_spend: {:.2}", spend);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Variations { json, .. } => *json,
    }
}
