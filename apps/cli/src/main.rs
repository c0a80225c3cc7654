//! Forge CLI
//!
//! Runs fine-tuning jobs against local projects and inspects the model runtime.

mod commands;

use clap::{Parser, Subcommand};
use commands::types::{DefaultsArgs, ModelsArgs, TrainArgs};
use forge_orchestrator::EngineConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Forge CLI - fine-tuning job orchestration
///
/// Loads training data from a project, fine-tunes a model through a fixed
/// pipeline of stages, converts the result and registers it with Ollama.
#[derive(Parser, Debug)]
#[command(name = "forge", author, version, about = "Forge - fine-tuning job orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Projects directory (overrides FORGE_PROJECTS and config files)
    #[arg(short, long, global = true)]
    projects: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a training job for a project
    ///
    /// Data files are read from `<projects>/<project>/data/`. Progress is
    /// rendered until the job finishes; Ctrl-C cancels the job.
    Train(TrainArgs),

    /// Print the effective default configuration as JSON
    Defaults(DefaultsArgs),

    /// List models registered with the local runtime
    Models(ModelsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so `--json` output stays machine readable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::discover();
    if let Some(projects) = args.projects {
        config.projects_dir = projects;
    }

    match args.command {
        Command::Train(train) => commands::train::execute(train, config).await,
        Command::Defaults(defaults) => commands::defaults::execute(&defaults, &config),
        Command::Models(models) => commands::models::execute(models, &config).await,
    }
}
