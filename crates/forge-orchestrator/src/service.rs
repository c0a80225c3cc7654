//! The public façade of the engine.

use crate::config::EngineConfig;
use crate::error::StartError;
use crate::executor::Orchestrator;
use crate::job::{JobSpec, TrainingJob};
use crate::progress::{self, PollIntervals, ProgressUpdate, StatusResponse};
use crate::registry::JobRegistry;
use chrono::Utc;
use forge_training::config::DEFAULT_OUTPUT_QUANTIZATION;
use forge_training::{ConfigOverrides, ProjectLayout, TrainingBackend};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Parameters of a new training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub project: String,
    pub model_id: String,
    /// Data files under `<project>/data`, ingested in this order.
    pub filenames: Vec<String>,
    #[serde(default = "default_format_variant")]
    pub format_variant: String,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub overrides: ConfigOverrides,
}

fn default_format_variant() -> String {
    DEFAULT_OUTPUT_QUANTIZATION.to_string()
}

impl StartJobRequest {
    #[must_use]
    pub fn new(project: impl Into<String>, model_id: impl Into<String>, filenames: Vec<String>) -> Self {
        Self {
            project: project.into(),
            model_id: model_id.into(),
            filenames,
            format_variant: default_format_variant(),
            target_name: None,
            overrides: ConfigOverrides::default(),
        }
    }

    #[must_use]
    pub fn with_format_variant(mut self, variant: impl Into<String>) -> Self {
        self.format_variant = variant.into();
        self
    }

    #[must_use]
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotRunning,
}

/// Starts, tracks and cancels training jobs, one active job per project.
#[derive(Debug)]
pub struct TrainingService {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl TrainingService {
    #[must_use]
    pub fn new(backend: Arc<dyn TrainingBackend>, config: EngineConfig) -> Self {
        let orchestrator = Orchestrator::new(backend, &config);
        Self::with_orchestrator(orchestrator, config)
    }

    /// Uses a preconfigured orchestrator, e.g. with different external tools.
    #[must_use]
    pub fn with_orchestrator(orchestrator: Orchestrator, config: EngineConfig) -> Self {
        Self { config, registry: Arc::new(JobRegistry::new()), orchestrator: Arc::new(orchestrator) }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn layout(&self, project: &str) -> ProjectLayout {
        ProjectLayout::new(self.config.project_root(project))
    }

    /// Admits a job and spawns its worker on the current tokio runtime.
    ///
    /// Returns as soon as the job is registered; the caller observes `idle`
    /// or `starting`. Nothing is registered when an error is returned.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn start_job(&self, request: StartJobRequest) -> Result<Arc<TrainingJob>, StartError> {
        // A busy project is reported before the request itself is validated;
        // `admit` repeats the check under its lock
        if self.registry.is_busy(&request.project) {
            warn!(project = %request.project, "Rejecting start: job still active");
            return Err(StartError::AlreadyRunning(request.project));
        }
        if request.filenames.is_empty() {
            warn!(project = %request.project, "Rejecting start: no data files");
            return Err(StartError::NoDataFiles);
        }

        let layout = self.layout(&request.project);
        if let Some(missing) = request.filenames.iter().find(|f| !layout.data_file(f).is_file()) {
            warn!(project = %request.project, file = %missing, "Rejecting start: data file not found");
            return Err(StartError::DataFileNotFound(missing.clone()));
        }

        let overrides = request.overrides.layered_over(ConfigOverrides::from_project_dir(layout.root()));
        let spec = JobSpec {
            project: request.project,
            layout,
            model_id: request.model_id,
            filenames: request.filenames,
            format_variant: request.format_variant,
            target_name: request.target_name,
            overrides,
            created_at: Utc::now(),
        };

        let (job, writer) = self.registry.admit(spec)?;
        info!(project = %job.spec().project, job_id = %job.id(), "Spawning training worker");

        let orchestrator = Arc::clone(&self.orchestrator);
        let worker = Arc::clone(&job);
        tokio::spawn(async move {
            orchestrator.run(worker, writer).await;
        });
        Ok(job)
    }

    /// Status of the project's most recent job; the idle payload when there is none.
    #[must_use]
    pub fn get_status(&self, project: &str) -> StatusResponse {
        StatusResponse::for_project(&self.registry, project)
    }

    #[must_use]
    pub fn is_running(&self, project: &str) -> bool {
        self.registry.is_running(project)
    }

    #[must_use]
    pub fn get_job(&self, project: &str) -> Option<Arc<TrainingJob>> {
        self.registry.get_job(project)
    }

    /// Requests cooperative cancellation of the project's job.
    pub fn cancel(&self, project: &str) -> CancelOutcome {
        if self.registry.cancel(project) { CancelOutcome::Cancelled } else { CancelOutcome::NotRunning }
    }

    /// Push stream of the project's progress at the configured intervals.
    pub fn subscribe_progress(&self, project: &str) -> impl Stream<Item = ProgressUpdate> + Send + use<> {
        let intervals = PollIntervals { active: self.config.active_poll, idle: self.config.idle_poll };
        progress::subscribe(Arc::clone(&self.registry), project.to_string(), intervals)
    }
}
