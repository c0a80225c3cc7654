//! Models command implementation.

use super::types::ModelsArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use forge_orchestrator::{EngineConfig, OllamaRegistrar};

/// Lists the models known to the local runtime.
pub async fn execute(args: ModelsArgs, config: &EngineConfig) -> Result<()> {
    let registrar = OllamaRegistrar::new(config.ollama.clone());
    let models = registrar.list_models().await.context("Failed to list registered models")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Registered Models ({})", models.len()).bold().cyan());
    println!();

    if models.is_empty() {
        println!("  {}", "No models registered with the runtime.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<40} {}", "Name", "Size");
    println!("{}", "─".repeat(56));
    for model in models {
        println!("{:<40} {}", model.name.cyan(), model.size.as_deref().unwrap_or("-").dimmed());
    }
    println!();
    Ok(())
}
