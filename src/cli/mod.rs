//! Thin CLI wrapper over the experiment runtime.
//!
//! Not hardened for production distribution (no shell completion, no
//! config-file discovery heuristics beyond the defaults below) — it exists
//! to demonstrate the wiring between [`crate::config`], [`crate::controller`],
//! and [`crate::rundata`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::ExperimentConfig;
use crate::controller::{ExperimentController, TurnLimitDecision};
use crate::session::SdkConfig;

#[derive(Parser)]
#[command(name = "helm")]
#[command(about = "Observation and governance runtime for multi-agent coding experiments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an experiment with the given pattern and task.
    Run {
        /// Path to the experiment pattern YAML file.
        pattern: PathBuf,
        /// Task to give to the agents.
        #[arg(short, long)]
        task: String,
        /// Path to the sandbox-agent binary.
        #[arg(long)]
        sdk_binary: Option<PathBuf>,
        /// Directory to store experiment data.
        #[arg(long)]
        experiments_dir: Option<PathBuf>,
        /// Action when an agent hits its turn limit: continue, kill, end.
        /// Without this flag the run ends the experiment (the CLI has no
        /// interactive prompt in this build).
        #[arg(long)]
        on_turn_limit: Option<String>,
    },
    /// Check the status of an experiment.
    Status {
        experiment_id: String,
        #[arg(long)]
        experiments_dir: Option<PathBuf>,
    },
    /// Stop a running experiment (placeholder: no cross-process control channel exists yet).
    Stop { experiment_id: String },
    /// Validate an experiment configuration file.
    Validate { pattern: PathBuf },
    /// List all experiments.
    List {
        #[arg(long)]
        experiments_dir: Option<PathBuf>,
    },
    /// Score a completed experiment (external judge backend, not implemented).
    Judge {
        experiment_id: String,
        #[arg(short, long, default_value = "escalation-calibration,goal-drift,failure-suppression")]
        dimensions: String,
        #[arg(short, long, default_value = "sdk")]
        backend: String,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(long)]
        experiments_dir: Option<PathBuf>,
    },
    /// Show the computed run-data artifact for a completed experiment.
    Analyze {
        experiment_id: String,
        #[arg(long)]
        experiments_dir: Option<PathBuf>,
    },
}

fn default_experiments_dir() -> PathBuf {
    PathBuf::from("experiments")
}

fn default_sdk_binary() -> PathBuf {
    // Resolved against PATH by the OS when spawned; a bare command name is
    // sufficient and matches the daemon contract's `npm install -g` story.
    PathBuf::from("sandbox-agent")
}

/// Run the parsed CLI, returning a process exit code (0 success, 1
/// error, 130 interrupt).
pub async fn dispatch(cli: Cli) -> i32 {
    let result = match cli.command {
        Commands::Run {
            pattern,
            task,
            sdk_binary,
            experiments_dir,
            on_turn_limit,
        } => run_experiment(pattern, task, sdk_binary, experiments_dir, on_turn_limit).await,
        Commands::Status {
            experiment_id,
            experiments_dir,
        } => status(&experiment_id, experiments_dir),
        Commands::Stop { experiment_id } => {
            println!("Stopping experiment: {experiment_id}");
            println!("Note: this command is not yet fully implemented");
            println!("Use Ctrl+C to stop a running experiment");
            Ok(ExitOutcome::Success)
        }
        Commands::Validate { pattern } => validate(&pattern),
        Commands::List { experiments_dir } => list(experiments_dir),
        Commands::Judge {
            experiment_id,
            dimensions,
            backend,
            model,
            experiments_dir,
        } => judge(&experiment_id, &dimensions, &backend, model, experiments_dir),
        Commands::Analyze {
            experiment_id,
            experiments_dir,
        } => analyze(&experiment_id, experiments_dir),
    };

    match result {
        Ok(ExitOutcome::Success) => 0,
        Ok(ExitOutcome::Interrupted) => 130,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

enum ExitOutcome {
    Success,
    Interrupted,
}

async fn run_experiment(
    pattern: PathBuf,
    task: String,
    sdk_binary: Option<PathBuf>,
    experiments_dir: Option<PathBuf>,
    on_turn_limit: Option<String>,
) -> Result<ExitOutcome> {
    let config = ExperimentConfig::from_yaml(&pattern)?;
    let experiments_dir = experiments_dir.unwrap_or_else(default_experiments_dir);
    std::fs::create_dir_all(&experiments_dir).context("creating experiments directory")?;

    let sdk_config = SdkConfig {
        binary_path: sdk_binary.unwrap_or_else(default_sdk_binary),
        ..SdkConfig::default()
    };

    let turn_limit_handler = match on_turn_limit.as_deref() {
        None => None,
        Some(action) => {
            let normalized = match action.to_lowercase().as_str() {
                "continue" => TurnLimitDecision::Continue,
                "kill" | "kill_agent" => TurnLimitDecision::KillAgent,
                "end" | "end_experiment" => TurnLimitDecision::EndExperiment,
                other => anyhow::bail!("--on-turn-limit must be one of: continue, kill, end (got '{other}')"),
            };
            Some(Arc::new(move |agent_id: &str, turns: u32, limit: u32| {
                println!("\nAgent '{agent_id}' reached turn limit ({turns}/{limit})");
                normalized.clone()
            }) as crate::controller::TurnLimitHandler)
        }
    };

    println!("Running experiment from: {}", pattern.display());
    let preview: String = task.chars().take(100).collect();
    println!(
        "Task: {preview}{}",
        if task.chars().count() > 100 { "..." } else { "" }
    );
    println!();

    let controller = Arc::new(ExperimentController::new(
        config,
        sdk_config,
        &experiments_dir,
        turn_limit_handler,
    ));

    let run_controller = Arc::clone(&controller);
    let run_future = tokio::spawn(async move { run_controller.run(&task).await });

    tokio::select! {
        outcome = run_future => {
            let result = outcome.context("experiment task panicked")??;
            if result.success {
                println!("\u{2713} Experiment completed: {}", result.experiment_id);
            } else {
                println!(
                    "\u{2717} Experiment failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            println!("  Directory: {}", result.experiment_dir.display());
            Ok(ExitOutcome::Success)
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nExperiment interrupted");
            controller.stop();
            Ok(ExitOutcome::Interrupted)
        }
    }
}

fn status(experiment_id: &str, experiments_dir: Option<PathBuf>) -> Result<ExitOutcome> {
    let experiments_dir = experiments_dir.unwrap_or_else(default_experiments_dir);
    let experiment_path = experiments_dir.join(experiment_id);
    if !experiment_path.exists() {
        anyhow::bail!("experiment not found: {experiment_id}");
    }

    let metadata_path = experiment_path.join("metadata.json");
    if let Ok(text) = std::fs::read_to_string(&metadata_path) {
        let metadata: crate::controller::metadata::ExperimentMetadata =
            serde_json::from_str(&text).context("parsing metadata.json")?;
        println!("Experiment: {}", metadata.name);
        println!("Pattern: {}", metadata.pattern);
        println!("Created: {}", metadata.created_at.to_rfc3339());
        let ids: Vec<&str> = metadata.agents.iter().map(|a| a.id.as_str()).collect();
        println!("Agents: {}", ids.join(", "));
    } else {
        println!("Experiment: {experiment_id}");
        println!("  (metadata not found)");
    }

    let signals_dir = experiment_path.join("coordination").join("signals");
    if let Ok(entries) = std::fs::read_dir(&signals_dir) {
        let names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        if !names.is_empty() {
            println!("Signals: {}", names.join(", "));
        }
    }

    let transcript_path = experiment_path.join("transcripts").join("full.json");
    if transcript_path.exists() {
        println!("Transcript: {}", transcript_path.display());
    }

    Ok(ExitOutcome::Success)
}

fn validate(pattern: &Path) -> Result<ExitOutcome> {
    let config = ExperimentConfig::from_yaml(pattern)?;
    println!("\u{2713} Valid configuration: {}", config.name);
    println!("  Agents: {}", config.agents.len());
    println!(
        "  Pattern: {}",
        if config.is_hub_and_spoke() { "hub-and-spoke" } else { "peer-network" }
    );
    println!("  Rules: {}", config.orchestrator.rules.len());
    println!("  Dimensions: {}", config.evaluation.dimensions.join(", "));
    Ok(ExitOutcome::Success)
}

fn list(experiments_dir: Option<PathBuf>) -> Result<ExitOutcome> {
    let experiments_dir = experiments_dir.unwrap_or_else(default_experiments_dir);
    if !experiments_dir.exists() {
        println!("No experiments found");
        return Ok(ExitOutcome::Success);
    }

    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = std::fs::read_dir(&experiments_dir)
        .context("reading experiments directory")?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.metadata().ok().and_then(|m| m.modified().ok()).map(|t| (e.path(), t)))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    if entries.is_empty() {
        println!("No experiments found");
        return Ok(ExitOutcome::Success);
    }

    println!("Experiments:");
    for (path, _) in entries.into_iter().take(20) {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        let metadata_path = path.join("metadata.json");
        if let Ok(text) = std::fs::read_to_string(&metadata_path) {
            if let Ok(metadata) = serde_json::from_str::<crate::controller::metadata::ExperimentMetadata>(&text) {
                println!("  {name}  [{}]  {}", metadata.pattern, metadata.created_at.to_rfc3339());
                continue;
            }
        }
        println!("  {name}");
    }
    Ok(ExitOutcome::Success)
}

fn judge(
    experiment_id: &str,
    dimensions: &str,
    backend: &str,
    model: Option<String>,
    experiments_dir: Option<PathBuf>,
) -> Result<ExitOutcome> {
    let experiments_dir = experiments_dir.unwrap_or_else(default_experiments_dir);
    let experiment_path = experiments_dir.join(experiment_id);
    if !experiment_path.exists() {
        anyhow::bail!("experiment not found: {experiment_id}");
    }

    println!("Judging experiment: {experiment_id}");
    println!("Backend: {backend}{}", model.map(|m| format!(" ({m})")).unwrap_or_default());
    println!("Dimensions: {}", dimensions.replace(',', ", "));
    anyhow::bail!(
        "judge backends ('{backend}') are an external collaborator and are not implemented in this build; \
         scores.json must be supplied out of band for `analyze` to pick up"
    )
}

fn analyze(experiment_id: &str, experiments_dir: Option<PathBuf>) -> Result<ExitOutcome> {
    let experiments_dir = experiments_dir.unwrap_or_else(default_experiments_dir);
    let experiment_path = experiments_dir.join(experiment_id);
    if !experiment_path.exists() {
        anyhow::bail!("experiment not found: {experiment_id}");
    }

    let run_data = crate::rundata::compute(&experiment_path)?;
    println!("Experiment: {}", run_data.experiment.name);
    println!("ID: {}", run_data.experiment.id);
    println!("Pattern: {}", run_data.experiment.pattern);
    println!("Created: {}", run_data.experiment.created_at.to_rfc3339());
    if let Some(task) = &run_data.experiment.task {
        let preview: String = task.chars().take(120).collect();
        println!("Task: {preview}{}", if task.chars().count() > 120 { "..." } else { "" });
    }
    println!();

    println!("Agents ({}):", run_data.agents.len());
    for agent in &run_data.agents {
        println!("  {} ({})", agent.id, agent.role.as_str());
    }
    println!();

    if let Some(run) = &run_data.run {
        println!("Run:");
        println!("  Success: {}", run.success);
        println!("  Duration: {:.1}s", run.duration_seconds);
        if let Some(error) = &run.error {
            println!("  Error: {error}");
        }
        if !run.agent_stats.is_empty() {
            println!("  Agent turns:");
            for (agent_id, stats) in &run.agent_stats {
                println!("    {agent_id}: {}", stats.turns);
            }
        }
        println!();
    }

    println!("Limits:");
    println!("  Max duration: {}", run_data.limits.max_duration);
    println!("  Max turns/agent: {}", run_data.limits.max_turns_per_agent);
    println!("  Max budget: ${}", run_data.limits.max_budget_usd);
    println!();

    println!("Transcript:");
    println!("  Total events: {}", run_data.transcript.total_events);
    println!("  Start: {}", run_data.transcript.start_time.to_rfc3339());
    if let Some(end) = run_data.transcript.end_time {
        println!("  End: {}", end.to_rfc3339());
    }
    println!();

    let orch = &run_data.evals.orchestration;
    println!("Orchestration evals:");
    println!(
        "  Parallelism efficiency: {} (critical path ratio: {})",
        fmt_opt(orch.parallelism.parallelism_efficiency),
        fmt_opt(orch.parallelism.critical_path_ratio),
    );
    println!(
        "  Coordination overhead: {} messages, {} workspace artifacts, {} msgs/assistant-step",
        orch.coordination.messages,
        orch.coordination.workspace_files,
        fmt_opt(orch.coordination.messages_per_assistant_step),
    );
    println!(
        "  Escalation precision/recall: {} / {}",
        fmt_opt(orch.escalation.precision),
        fmt_opt(orch.escalation.recall),
    );

    if run_data.evals.judge.is_some() {
        println!("Scores: available (scores.json)");
    } else {
        println!("Scores: not yet judged (run: helm judge {experiment_id})");
    }

    Ok(ExitOutcome::Success)
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.3}"),
        None => "N/A".to_string(),
    }
}
