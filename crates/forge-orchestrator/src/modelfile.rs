//! Ollama Modelfile rendering.

use chrono::{DateTime, Local};
use forge_training::ModelfileParams;
use std::fmt::Write as _;
use std::path::Path;

/// Renders a Modelfile that serves `model_path` with a question/answer template.
#[must_use]
pub fn render(project: &str, model_path: &Path, params: &ModelfileParams, created: DateTime<Local>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Modelfile for Ollama");
    let _ = writeln!(out, "# Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "# Project: {project}");
    out.push('\n');

    let _ = writeln!(out, "FROM {}", model_path.display());
    out.push('\n');

    out.push_str("# Template for question-answer format\n");
    out.push_str("TEMPLATE \"\"\"### Question:\n{{ .Prompt }}\n\n### Answer:\n\"\"\"\n\n");

    out.push_str("# Parameters\n");
    let _ = writeln!(out, "PARAMETER temperature {}", params.temperature);
    let _ = writeln!(out, "PARAMETER top_p {}", params.top_p);
    let _ = writeln!(out, "PARAMETER top_k {}", params.top_k);
    let _ = writeln!(out, "PARAMETER repeat_penalty {}", params.repeat_penalty);
    let _ = writeln!(out, "PARAMETER repeat_last_n {}", params.repeat_last_n);
    let _ = writeln!(out, "PARAMETER num_ctx {}", params.num_ctx);
    for stop in &params.stop {
        let _ = writeln!(out, "PARAMETER stop \"{}\"", stop.replace('"', "\\\""));
    }
    out.push('\n');

    out.push_str("# System prompt\n");
    let _ = writeln!(out, "SYSTEM {}", params.system);
    out
}

/// Renders and writes the Modelfile, referencing the absolute model path.
pub fn write(
    path: &Path,
    project: &str,
    model_path: &Path,
    params: &ModelfileParams,
) -> std::io::Result<()> {
    let absolute = std::fs::canonicalize(model_path).unwrap_or_else(|_| model_path.to_path_buf());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render(project, &absolute, params, Local::now()))
}
