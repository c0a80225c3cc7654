//! Defaults command implementation.

use super::types::DefaultsArgs;
use anyhow::Result;
use forge_orchestrator::EngineConfig;
use forge_training::config::DEFAULT_OUTPUT_QUANTIZATION;
use forge_training::{ConfigOverrides, DeviceKind};
use serde_json::json;

/// Prints the effective configuration for a device as JSON.
pub fn execute(args: &DefaultsArgs, config: &EngineConfig) -> Result<()> {
    let device = DeviceKind::from(args.device);
    let overrides = args
        .project
        .as_deref()
        .map(|project| ConfigOverrides::from_project_dir(&config.project_root(project)))
        .unwrap_or_default();

    let out = json!({
        "device": device,
        "trainingConfig": overrides.training_params(device),
        "loraConfig": overrides.adapter_params(),
        "quantizationConfig": overrides.quantization_params(),
        "modelfileConfig": overrides.modelfile_params(),
        "outputQuantization": DEFAULT_OUTPUT_QUANTIZATION,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
