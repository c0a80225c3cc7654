//! Training command implementation.

use super::types::TrainArgs;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use forge_orchestrator::{EngineConfig, ProgressUpdate, StartJobRequest, StatusResponse, TrainingService};
use forge_training::{BigramBackend, JobStatus, StageId, StageStatus};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

pub async fn execute(args: TrainArgs, config: EngineConfig) -> Result<()> {
    let service = TrainingService::new(Arc::new(BigramBackend::new()), config);

    let mut request = StartJobRequest::new(args.project.clone(), args.model.clone(), args.files.clone());
    if let Some(variant) = args.quantization {
        request = request.with_format_variant(variant);
    }
    if let Some(name) = args.target_name {
        request = request.with_target_name(name);
    }

    let job = service
        .start_job(request)
        .with_context(|| format!("Failed to start training for project '{}'", args.project))?;
    info!(job_id = %job.id(), project = %args.project, "Training job started");

    let mut updates = Box::pin(service.subscribe_progress(&args.project));
    let mut renderer = Renderer::new(args.json);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let last = loop {
        tokio::select! {
            result = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if result.is_ok() {
                    eprintln!("{}", "Cancelling training job...".yellow());
                    service.cancel(&args.project);
                }
            }
            update = updates.next() => {
                let Some(update) = update else {
                    bail!("Progress stream ended unexpectedly");
                };
                renderer.render(&update)?;
                if let ProgressUpdate::Done(status) = update {
                    break status;
                }
            }
        }
    };

    if last.status != JobStatus::Completed {
        let code = last.error_code.map_or_else(|| "none".to_string(), |c| c.to_string());
        bail!("Training job ended with status '{}' (error code: {})", last.status, code);
    }
    Ok(())
}

/// Prints progress updates either as JSON lines or as one line per change.
struct Renderer {
    json: bool,
    last_line: Option<String>,
}

impl Renderer {
    fn new(json: bool) -> Self {
        Self { json, last_line: None }
    }

    fn render(&mut self, update: &ProgressUpdate) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(update)?);
            return Ok(());
        }

        match update {
            ProgressUpdate::Status(_) => {}
            ProgressUpdate::Progress(status) => {
                let line = progress_line(status);
                if self.last_line.as_ref() != Some(&line) {
                    println!("{line}");
                    self.last_line = Some(line);
                }
            }
            ProgressUpdate::Done(status) => print_summary(status),
        }
        Ok(())
    }
}

fn active_stage(status: &StatusResponse) -> Option<StageId> {
    status.stages.iter().find(|s| s.status == StageStatus::InProgress).map(|s| s.id)
}

fn progress_line(status: &StatusResponse) -> String {
    let mut line = format!("[{:>3.0}%] {}", status.progress, status.status);
    if let Some(stage) = active_stage(status) {
        let percent = status.stages.iter().find(|s| s.id == stage).map_or(0, |s| s.progress);
        line.push_str(&format!("  {stage} {percent}%"));
        if stage == StageId::Train && status.total_steps > 0 {
            line.push_str(&format!(" (step {}/{})", status.current_step, status.total_steps));
        }
    }
    line
}

fn print_summary(status: &StatusResponse) {
    println!();
    match status.status {
        JobStatus::Completed => println!("{}", "Training complete".bold().green()),
        JobStatus::Cancelled => println!("{}", "Training cancelled".bold().yellow()),
        _ => println!("{}", "Training failed".bold().red()),
    }
    if let Some(job_id) = &status.job_id {
        println!("  Job: {}", job_id.to_string().cyan());
    }
    if let Some(device) = status.device {
        println!("  Device: {}", device.to_string().dimmed());
    }
    if let Some(code) = status.error_code {
        println!("  Error: {}", code.to_string().red());
    }
    for stage in &status.stages {
        let marker = match stage.status {
            StageStatus::Completed => "✓".green(),
            StageStatus::Failed => "✗".red(),
            StageStatus::Skipped => "-".dimmed(),
            StageStatus::InProgress | StageStatus::Pending => "·".dimmed(),
        };
        let errors = if stage.error_count > 0 { format!(" ({} rows skipped)", stage.error_count) } else { String::new() };
        println!("  {marker} {}{errors}", stage.id);
    }
    for file in &status.files {
        println!(
            "  {} {} loaded, {} skipped",
            file.filename.cyan(),
            file.rows_loaded,
            file.rows_skipped
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_training::StageProgress;

    fn status_in(stage: StageId, progress: u8) -> StatusResponse {
        let mut status = StatusResponse::idle("demo");
        status.status = JobStatus::Training;
        status.progress = 42.0;
        status.current_step = 3;
        status.total_steps = 10;
        for s in &mut status.stages {
            if s.id == stage {
                s.status = StageStatus::InProgress;
                s.progress = progress;
            }
        }
        status
    }

    #[test]
    fn test_progress_line_shows_active_stage_and_steps() {
        let line = progress_line(&status_in(StageId::Train, 30));
        assert_eq!(line, format!("[ 42%] training  {} 30% (step 3/10)", StageId::Train));
    }

    #[test]
    fn test_progress_line_without_active_stage() {
        let status = StatusResponse::idle("demo");
        assert_eq!(progress_line(&status), "[  0%] idle");
    }

    #[test]
    fn test_active_stage_ignores_completed() {
        let mut status = status_in(StageId::Tokenize, 10);
        status.stages[0] = StageProgress { status: StageStatus::Completed, ..status.stages[0].clone() };
        assert_eq!(active_stage(&status), Some(StageId::Tokenize));
    }
}
