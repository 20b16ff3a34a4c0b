use anyhow::{Context, Result};
use bench_runner::{BenchConfig, SuitePlan, SuiteReport};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbench", version, about = "Adaptive benchmark runner for external solvers")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct Overrides {
    /// Directory holding one subdirectory per track.
    #[arg(long)]
    corpus: Option<PathBuf>,
    #[arg(long)]
    results_dir: Option<PathBuf>,
    #[arg(long)]
    program: Option<PathBuf>,
    /// Benchmark only these tracks (repeatable).
    #[arg(long)]
    track: Vec<String>,
    /// Benchmark only these configuration labels (repeatable).
    #[arg(long)]
    configuration: Vec<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    budget_ms: Option<f64>,
    #[arg(long)]
    parallel_configurations: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark every configuration over every track.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        json: bool,
    },
    /// Show what `run` would do without launching the solver.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        json: bool,
    },
    /// Write a configuration file with the default settings.
    Init {
        #[arg(long, default_value = bench_runner::config::DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Read back a result log.
    Show {
        log: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            overrides,
            json,
        } => {
            let (config, source) = load_config(config.as_deref(), &overrides)?;
            let result = bench_runner::run_benchmarks(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "config_path": source.map(|p| p.display().to_string()),
                    "report": serde_json::to_value(&result.report)?,
                    "manifest": result.manifest_path.display().to_string(),
                })));
            }
            print_report(&result.report);
            println!("manifest: {}", result.manifest_path.display());
        }
        Commands::Describe {
            config,
            overrides,
            json,
        } => {
            let (config, source) = load_config(config.as_deref(), &overrides)?;
            let plan = bench_runner::plan_suite(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config_path": source.map(|p| p.display().to_string()),
                    "plan": serde_json::to_value(&plan)?,
                })));
            }
            match &source {
                Some(path) => println!("config: {}", path.display()),
                None => println!("config: built-in defaults"),
            }
            print_plan(&plan);
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "config file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, bench_runner::config::config_template())?;
            println!("wrote: {}", path.display());
            println!("next: sbench describe --config {}", path.display());
        }
        Commands::Show { log, json } => {
            let text = std::fs::read_to_string(&log)
                .with_context(|| format!("failed to read {}", log.display()))?;
            let entries = bench_core::parse_log(&text)
                .with_context(|| format!("malformed result log {}", log.display()))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "log": log.display().to_string(),
                    "entries": serde_json::to_value(&entries)?,
                })));
            }
            println!(
                "{:<28} {:>14} {:>16} {:>16} {:>6}",
                "file", "cost", "avg_time (ms)", "avg-memory (KB)", "runs"
            );
            for entry in &entries {
                match &entry.result {
                    Some(s) => println!(
                        "{:<28} {:>14.2} {:>16.2} {:>16.2} {:>6}",
                        entry.file_name, s.reported_value, s.mean_time_ms, s.mean_memory_kb, s.runs
                    ),
                    None => println!("{:<28} {:>14}", entry.file_name, "-"),
                }
            }
        }
    }
    Ok(None)
}

fn load_config(
    explicit: Option<&Path>,
    overrides: &Overrides,
) -> Result<(BenchConfig, Option<PathBuf>)> {
    let (mut config, source) = BenchConfig::resolve(explicit)?;
    apply_overrides(&mut config, overrides)?;
    match &source {
        Some(path) => tracing::debug!(path = %path.display(), "configuration loaded"),
        None => tracing::debug!("no configuration file, using built-in defaults"),
    }
    Ok((config, source))
}

fn apply_overrides(config: &mut BenchConfig, overrides: &Overrides) -> Result<()> {
    if let Some(root) = &overrides.corpus {
        config.corpus.root = root.clone();
    }
    if let Some(dir) = &overrides.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(program) = &overrides.program {
        config.solver.program = program.clone();
    }
    if !overrides.track.is_empty() {
        config.corpus.tracks = overrides.track.clone();
    }
    if let Some(timeout) = overrides.timeout_secs {
        config.limits.timeout_secs = timeout;
    }
    if let Some(budget) = overrides.budget_ms {
        config.limits.budget_ms = budget;
    }
    if overrides.parallel_configurations {
        config.parallel_configurations = true;
    }
    config.select_configurations(&overrides.configuration)?;
    config.validate()?;
    Ok(())
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
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Show { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn print_report(report: &SuiteReport) {
    for pass in &report.passes {
        match &pass.error {
            Some(err) => println!("{}/{}: aborted: {}", pass.track, pass.configuration, err),
            None => println!(
                "{}/{}: {} tasks, {} completed, {} failed -> {}",
                pass.track,
                pass.configuration,
                pass.tasks,
                pass.completed,
                pass.failed,
                pass.log.display()
            ),
        }
    }
    println!(
        "total: {} tasks, {} completed, {} failed, {} aborted passes",
        report.tasks(),
        report.completed(),
        report.failed(),
        report.aborted()
    );
}

fn print_plan(plan: &SuitePlan) {
    println!("program: {}", plan.solver.program.display());
    if plan.solver.wrapper.is_empty() {
        println!("wrapper: none");
    } else {
        println!("wrapper: {}", plan.solver.wrapper.join(" "));
    }
    println!("memory: {:?}", plan.solver.memory);
    println!("timeout_secs: {}", plan.limits.timeout_secs);
    println!("budget_ms: {}", plan.limits.budget_ms);
    println!(
        "repetitions: {}..={}",
        plan.limits.min_repetitions, plan.limits.max_repetitions
    );
    println!("parallel_configurations: {}", plan.parallel_configurations);
    println!("results_dir: {}", plan.results_dir.display());
    for track in &plan.tracks {
        match &track.error {
            Some(err) => println!("track {}: {}", track.name, err),
            None => println!("track {}: {} inputs", track.name, track.inputs),
        }
    }
    for configuration in &plan.configurations {
        println!(
            "configuration {}: {} -> {}",
            configuration.label,
            configuration.options,
            configuration.log_name()
        );
    }
    println!("total_tasks: {}", plan.total_tasks);
}
