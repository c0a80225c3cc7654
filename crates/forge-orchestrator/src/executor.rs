//! Job execution engine.
//!
//! The [`Orchestrator`] drives one job through the nine pipeline stages in
//! order. It is the only code that writes job state; backend calls receive a
//! [`StageReporter`] for progress and cancellation, and the training loop a
//! [`TrainingCallback`].

use crate::config::EngineConfig;
use crate::convert::FormatConverter;
use crate::error::{OrchestrationError, Result};
use crate::job::{JobWriter, TrainingJob};
use crate::modelfile;
use crate::registrar::{OllamaRegistrar, validate_model_name};
use forge_training::{
    DatasetHandle, DeviceKind, ErrorCode, IngestObserver, IngestSource, JobId, JobState, JobStatus,
    ModelHandle, RecordStream, RowRejection, StageId, StageReporter, TokenizerHandle, TrainRequest,
    TrainingBackend, TrainingCallback,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Share of the tokenize stage covered by file ingestion.
const INGEST_SHARE: u8 = 50;

/// Artifacts handed from one stage to the next.
#[derive(Debug, Default)]
struct Artifacts {
    device: DeviceKind,
    model: Option<ModelHandle>,
    tokenizer: Option<TokenizerHandle>,
    dataset: Option<DatasetHandle>,
    adapter_path: Option<PathBuf>,
    merged_path: Option<PathBuf>,
    converted_path: Option<PathBuf>,
}

fn require<'a, T>(slot: &'a Option<T>, stage: StageId, what: &str) -> Result<&'a T> {
    slot.as_ref().ok_or_else(|| {
        OrchestrationError::classified(stage, ErrorCode::Unexpected, format!("no {what} from an earlier stage"))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// How a run ended; published to the job state once the cache is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    /// Cancellation observed after the given stage, or before the first one.
    Cancelled(Option<StageId>),
    Failed(Option<StageId>, ErrorCode),
    /// The job was not in a startable status.
    NotStarted,
}

/// Removes the job's scratch cache when the worker exits, however it exits.
struct CacheGuard {
    dir: PathBuf,
    job_id: JobId,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(job_id = %self.job_id, cache = %self.dir.display(), "Released training cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %self.job_id,
                cache = %self.dir.display(),
                error = %e,
                "Failed to release training cache"
            ),
        }
    }
}

/// Progress sink for one backend call, mapped into a slice of the stage's range.
struct Reporter<'a> {
    writer: &'a JobWriter,
    stage: StageId,
    cancel: &'a CancellationToken,
    offset: u8,
    span: u8,
}

impl<'a> Reporter<'a> {
    fn new(writer: &'a JobWriter, stage: StageId, cancel: &'a CancellationToken) -> Self {
        Self { writer, stage, cancel, offset: 0, span: 100 }
    }

    fn scaled(mut self, offset: u8, span: u8) -> Self {
        self.offset = offset;
        self.span = span;
        self
    }
}

impl StageReporter for Reporter<'_> {
    fn report_progress(&self, percent: u8) {
        let scaled = u16::from(self.offset) + u16::from(percent.min(100)) * u16::from(self.span) / 100;
        self.writer.raise_stage_progress(self.stage, u8::try_from(scaled).unwrap_or(100));
    }

    fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }
}

/// Publishes per-file ingestion events into the job state.
struct IngestTracker {
    writer: JobWriter,
    total: usize,
}

impl IngestTracker {
    fn raise_ingest_progress(state: &mut JobState, total: usize) {
        if total == 0 {
            return;
        }
        let percent = u8::try_from(state.files_done() * usize::from(INGEST_SHARE) / total).unwrap_or(INGEST_SHARE);
        if percent > state.stage(StageId::Tokenize).progress {
            state.set_stage_progress(StageId::Tokenize, percent);
        }
    }
}

impl IngestObserver for IngestTracker {
    fn file_started(&self, index: usize, filename: &str) {
        debug!(job_id = %self.writer.job_id(), file = filename, index, "Reading data file");
        self.writer.update(|s| s.file_started(index));
    }

    fn file_failed(&self, index: usize, filename: &str) {
        warn!(job_id = %self.writer.job_id(), file = filename, index, "Data file could not be ingested");
        let total = self.total;
        self.writer.update(|s| {
            s.file_failed(index);
            Self::raise_ingest_progress(s, total);
        });
    }

    fn row_loaded(&self, index: usize) {
        self.writer.update(|s| s.file_row_loaded(index));
    }

    fn row_skipped(&self, index: usize, _filename: &str, _line: usize, _reason: &RowRejection) {
        self.writer.update(|s| s.file_row_skipped(index));
    }

    fn file_completed(&self, index: usize, filename: &str, rows_loaded: u64, rows_skipped: u64) {
        info!(
            job_id = %self.writer.job_id(),
            file = filename,
            rows_loaded,
            rows_skipped,
            "Data file ingested"
        );
        let total = self.total;
        self.writer.update(|s| {
            s.file_completed(index, rows_loaded, rows_skipped);
            Self::raise_ingest_progress(s, total);
        });
    }
}

/// Step tracking for the training loop.
struct StepTracker<'a> {
    writer: &'a JobWriter,
    cancel: &'a CancellationToken,
}

impl TrainingCallback for StepTracker<'_> {
    fn on_train_begin(&self, total_steps: u64) {
        info!(job_id = %self.writer.job_id(), total_steps, "Training started");
        self.writer.update(|s| s.set_steps(0, total_steps));
    }

    fn on_step(&self, step: u64, total_steps: u64) -> bool {
        let percent = if total_steps == 0 { 100 } else { step.min(total_steps) * 100 / total_steps };
        self.writer.update(|s| {
            s.set_steps(step, total_steps);
            s.set_stage_progress(StageId::Train, u8::try_from(percent).unwrap_or(100));
        });
        self.cancel.is_cancelled()
    }
}

/// Runs jobs through the stage pipeline.
pub struct Orchestrator {
    backend: Arc<dyn TrainingBackend>,
    converter: FormatConverter,
    registrar: OllamaRegistrar,
    ingest_pacing: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.id())
            .field("converter", &self.converter)
            .field("registrar", &self.registrar)
            .field("ingest_pacing", &self.ingest_pacing)
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with external tools taken from `config`.
    #[must_use]
    pub fn new(backend: Arc<dyn TrainingBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            converter: FormatConverter::new(config.python.clone(), config.llama_cpp_dir.clone()),
            registrar: OllamaRegistrar::new(config.ollama.clone()),
            ingest_pacing: config.ingest_pacing,
        }
    }

    #[must_use]
    pub fn with_converter(mut self, converter: FormatConverter) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn with_registrar(mut self, registrar: OllamaRegistrar) -> Self {
        self.registrar = registrar;
        self
    }

    /// Delay before ingestion starts, letting observers render pending files.
    #[must_use]
    pub fn with_ingest_pacing(mut self, pacing: Duration) -> Self {
        self.ingest_pacing = pacing;
        self
    }

    /// Runs `job` to a terminal status.
    ///
    /// Never returns an error: every outcome is recorded in the job state.
    pub async fn run(&self, job: Arc<TrainingJob>, writer: JobWriter) {
        let spec = job.spec();
        let cache = CacheGuard { dir: spec.layout.cache_dir(), job_id: job.id().clone() };

        let outcome = AssertUnwindSafe(self.drive(&job, &writer)).catch_unwind().await.unwrap_or_else(|payload| {
            error!(job_id = %job.id(), panic = %panic_message(payload.as_ref()), "Training worker panicked");
            Outcome::Failed(None, ErrorCode::Unexpected)
        });

        // The cache is gone before readers observe a terminal status
        drop(cache);

        match outcome {
            Outcome::Completed => {
                writer.update(JobState::complete);
                info!(job_id = %job.id(), project = %spec.project, "Training job completed");
            }
            Outcome::Cancelled(stage) => {
                writer.update(JobState::cancel);
                info!(
                    job_id = %job.id(),
                    project = %spec.project,
                    stage = stage.map(StageId::as_str),
                    "Training job cancelled"
                );
            }
            Outcome::Failed(Some(stage), code) => writer.update(|s| s.fail_stage(stage, code)),
            Outcome::Failed(None, code) => writer.update(|s| {
                if !s.status.is_terminal() {
                    s.fail(code);
                }
            }),
            Outcome::NotStarted => {}
        }
    }

    async fn drive(&self, job: &TrainingJob, writer: &JobWriter) -> Outcome {
        let spec = job.spec();
        let job_id = job.id();

        info!(
            job_id = %job_id,
            project = %spec.project,
            model = %spec.model_id,
            files = spec.filenames.len(),
            backend = self.backend.id(),
            "Training job started"
        );

        if let Err(current) = writer.transition(JobStatus::Starting) {
            warn!(job_id = %job_id, status = %current, "Job cannot be started from its current status");
            return Outcome::NotStarted;
        }
        if job.is_cancelled() {
            return Outcome::Cancelled(None);
        }
        if let Err(current) = writer.begin_stage(StageId::ALL[0]) {
            let e = OrchestrationError::InvalidTransition(StageId::ALL[0], current);
            error!(job_id = %job_id, error = %e, "Failed to enter first stage");
            return Outcome::Failed(None, e.code());
        }

        let mut artifacts = Artifacts::default();
        for (index, stage) in StageId::ALL.into_iter().enumerate() {
            info!(job_id = %job_id, stage = %stage, "Stage started");

            let outcome = AssertUnwindSafe(self.run_stage(stage, job, writer, &mut artifacts))
                .catch_unwind()
                .await;
            let result = outcome
                .unwrap_or_else(|payload| Err(OrchestrationError::Panicked(stage, panic_message(payload.as_ref()))));

            if job.is_cancelled() {
                return Outcome::Cancelled(Some(stage));
            }

            if let Err(e) = result {
                error!(job_id = %job_id, stage = %stage, code = %e.code(), error = %e, "Stage failed");
                return Outcome::Failed(Some(stage), e.code());
            }

            info!(job_id = %job_id, stage = %stage, "Stage completed");
            let next = StageId::ALL.get(index + 1).copied();
            if let Err(current) = writer.advance(stage, next) {
                let e = OrchestrationError::InvalidTransition(next.unwrap_or(stage), current);
                error!(job_id = %job_id, error = %e, "Failed to enter next stage");
                return Outcome::Failed(None, e.code());
            }
        }
        Outcome::Completed
    }

    async fn run_stage(
        &self,
        stage: StageId,
        job: &TrainingJob,
        writer: &JobWriter,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        let spec = job.spec();
        let reporter = Reporter::new(writer, stage, job.cancellation());
        let failed = |e: forge_training::TrainingError| OrchestrationError::stage(stage, e);

        match stage {
            StageId::DetectDevice => {
                let device = match self.backend.detect_device().await {
                    Ok(device) => device,
                    Err(e) => {
                        warn!(job_id = %job.id(), error = %e, "Device detection failed, falling back to CPU");
                        DeviceKind::Cpu
                    }
                };
                artifacts.device = device;
                writer.update(|s| s.device = Some(device));

                let params = spec.overrides.training_params(device);
                info!(
                    job_id = %job.id(),
                    device = %device,
                    epochs = params.num_train_epochs,
                    batch_size = params.per_device_train_batch_size,
                    learning_rate = params.learning_rate,
                    max_length = params.max_length,
                    fp16 = params.use_fp16(),
                    bf16 = params.bf16,
                    "Resolved training configuration"
                );
            }
            StageId::ImportRuntime => {
                self.backend.import_runtime(&reporter).await.map_err(failed)?;
            }
            StageId::LoadModel => {
                let quantization = spec.overrides.quantization_params();
                let loaded = self
                    .backend
                    .load_model(&spec.model_id, artifacts.device, &quantization, &reporter)
                    .await
                    .map_err(failed)?;
                debug!(job_id = %job.id(), model = loaded.model.label(), "Base model loaded");
                artifacts.model = Some(loaded.model);
                artifacts.tokenizer = Some(loaded.tokenizer);
            }
            StageId::SetupAdapter => {
                let model = require(&artifacts.model, stage, "model")?.clone();
                let adapted = self
                    .backend
                    .attach_adapter(model, &spec.overrides.adapter_params(), &reporter)
                    .await
                    .map_err(failed)?;
                artifacts.model = Some(adapted);
            }
            StageId::Tokenize => self.tokenize(job, writer, artifacts).await?,
            StageId::Train => {
                let model = require(&artifacts.model, stage, "model")?.clone();
                let tokenizer = require(&artifacts.tokenizer, stage, "tokenizer")?.clone();
                let dataset = require(&artifacts.dataset, stage, "dataset")?.clone();
                let params = spec.overrides.training_params(artifacts.device);
                let output_dir = spec.layout.run_dir();
                let callback = StepTracker { writer, cancel: job.cancellation() };

                let request = TrainRequest {
                    model: &model,
                    tokenizer: &tokenizer,
                    dataset: &dataset,
                    params: &params,
                    device: artifacts.device,
                    output_dir: &output_dir,
                    reporter: &reporter,
                };
                let adapter = self.backend.train(request, &callback).await.map_err(failed)?;
                info!(job_id = %job.id(), adapter = %adapter.display(), "Adapter checkpoint saved");
                artifacts.adapter_path = Some(adapter);
            }
            StageId::MergeAdapter => {
                spec.layout.ensure_output_dirs().map_err(failed)?;
                let adapter = require(&artifacts.adapter_path, stage, "adapter checkpoint")?;
                let merged = self
                    .backend
                    .merge_adapter(adapter, &spec.model_id, &spec.layout.ollama_dir(), &reporter)
                    .await
                    .map_err(failed)?;
                info!(job_id = %job.id(), merged = %merged.display(), "Adapter merged");
                artifacts.merged_path = Some(merged);
            }
            StageId::ConvertFormat => {
                let merged = require(&artifacts.merged_path, stage, "merged model")?;
                let version = spec
                    .layout
                    .next_model_version()
                    .map_err(|e| OrchestrationError::classified(stage, ErrorCode::ConversionFailed, e))?;
                let outfile = spec.layout.model_file(version);
                let variant = spec.overrides.quantization_params().output_variant(&spec.format_variant);

                reporter.report_progress(10);
                let converted = self
                    .converter
                    .convert(merged, &outfile, &variant)
                    .await
                    .map_err(|e| OrchestrationError::classified(stage, e.code(), e))?;
                info!(job_id = %job.id(), model = %converted.display(), variant = %variant, "Model converted");
                artifacts.converted_path = Some(converted);
            }
            StageId::RegisterModel => {
                let converted = require(&artifacts.converted_path, stage, "converted model")?;
                self.register(job, converted, &reporter).await?;
            }
        }
        Ok(())
    }

    async fn tokenize(&self, job: &TrainingJob, writer: &JobWriter, artifacts: &mut Artifacts) -> Result<()> {
        let stage = StageId::Tokenize;
        let spec = job.spec();
        let tokenizer = require(&artifacts.tokenizer, stage, "tokenizer")?.clone();

        if !self.ingest_pacing.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.ingest_pacing) => {}
                () = job.cancellation().cancelled() => return Ok(()),
            }
        }

        let sources = spec
            .filenames
            .iter()
            .enumerate()
            .map(|(index, filename)| IngestSource {
                index,
                filename: filename.clone(),
                path: spec.layout.data_file(filename),
            })
            .collect();
        let tracker = Arc::new(IngestTracker { writer: writer.clone(), total: spec.filenames.len() });
        let records = RecordStream::new(sources, tracker).with_cancellation(job.cancellation().clone());
        let report = records.report();

        let reporter = Reporter::new(writer, stage, job.cancellation()).scaled(INGEST_SHARE, 100 - INGEST_SHARE);
        let max_length = spec.overrides.training_params(artifacts.device).max_length;
        let outcome = self
            .backend
            .tokenize(records, &tokenizer, max_length, &spec.layout.cache_dir(), &reporter)
            .await;

        writer.update(JobState::skip_open_files);
        if let Some(e) = report.take_error() {
            return Err(OrchestrationError::stage(stage, format!("failed to read data files: {e}")));
        }
        if report.rows_loaded() == 0 {
            return Err(OrchestrationError::stage(stage, "no valid training rows were loaded"));
        }
        let dataset = outcome.map_err(|e| OrchestrationError::stage(stage, e))?;

        info!(
            job_id = %job.id(),
            rows_loaded = report.rows_loaded(),
            rows_skipped = report.rows_skipped(),
            dataset = dataset.label(),
            "Dataset tokenized"
        );
        artifacts.dataset = Some(dataset);
        Ok(())
    }

    async fn register(&self, job: &TrainingJob, model_path: &std::path::Path, reporter: &Reporter<'_>) -> Result<()> {
        let stage = StageId::RegisterModel;
        let spec = job.spec();
        let modelfile_path = spec.layout.modelfile_path();

        modelfile::write(&modelfile_path, &spec.project, model_path, &spec.overrides.modelfile_params())
            .map_err(|e| OrchestrationError::stage(stage, format!("failed to write Modelfile: {e}")))?;
        reporter.report_progress(50);
        info!(job_id = %job.id(), modelfile = %modelfile_path.display(), "Modelfile written");

        let Some(name) = spec.target_name.as_deref() else {
            debug!(job_id = %job.id(), "No registration target, skipping ollama create");
            return Ok(());
        };
        validate_model_name(name).map_err(|e| OrchestrationError::stage(stage, e))?;

        match self.registrar.model_exists(name).await {
            Ok(true) => info!(job_id = %job.id(), model = name, "Replacing existing model"),
            Ok(false) => {}
            Err(e) => debug!(job_id = %job.id(), error = %e, "Could not list registered models"),
        }
        self.registrar
            .create(name, &modelfile_path)
            .await
            .map_err(|e| OrchestrationError::stage(stage, e))?;
        info!(job_id = %job.id(), model = name, "Model registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reporter_scales_into_its_slice() {
        let (job, writer) = crate::job::TrainingJob::new(crate::job::JobSpec {
            project: "demo".to_string(),
            layout: forge_training::ProjectLayout::new(std::env::temp_dir().join("forge-reporter-test")),
            model_id: "tiny".to_string(),
            filenames: Vec::new(),
            format_variant: "q8_0".to_string(),
            target_name: None,
            overrides: forge_training::ConfigOverrides::default(),
            created_at: chrono::Utc::now(),
        });
        let token = CancellationToken::new();
        let reporter = Reporter::new(&writer, StageId::Tokenize, &token).scaled(50, 50);

        reporter.report_progress(0);
        assert_eq!(job.snapshot().stage(StageId::Tokenize).progress, 50);
        reporter.report_progress(40);
        assert_eq!(job.snapshot().stage(StageId::Tokenize).progress, 70);
        reporter.report_progress(255);
        assert_eq!(job.snapshot().stage(StageId::Tokenize).progress, 100);
        assert!(!reporter.is_cancelled());
        token.cancel();
        assert!(reporter.is_cancelled());
    }

    #[test]
    fn test_cache_guard_removes_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".cache").join("training");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tokenized.jsonl"), "x").unwrap();

        drop(CacheGuard { dir: dir.clone(), job_id: JobId::new() });
        assert!(!dir.exists());

        // Missing directory is fine
        drop(CacheGuard { dir, job_id: JobId::new() });
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
