//! Shared test utilities for Forge orchestrator integration tests.
//!
//! Provides a scriptable fake backend and helpers that lay out a project
//! directory with data files and fake external tools.

#![allow(dead_code)]

use async_trait::async_trait;
use forge_orchestrator::{EngineConfig, FormatConverter, Orchestrator, StartJobRequest, TrainingJob, TrainingService};
use forge_training::{
    AdapterParams, DatasetHandle, DeviceKind, JobState, LoadedModel, ModelHandle, Opaque, QuantizationParams,
    RecordStream, StageId, StageReporter, TokenizerHandle, TrainRequest, TrainingBackend, TrainingCallback,
    TrainingError, TrainingParams, TrainingRecord, TrainingResult,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PROJECT: &str = "demo";
pub const VALID_ROW: &str = r#"{"instruction":"What is Rust?","output":"A systems language."}"#;
pub const WAIT: Duration = Duration::from_secs(20);

/// Values the fake backend received from the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Seen {
    pub device: Option<DeviceKind>,
    pub training: Option<TrainingParams>,
    pub adapter: Option<AdapterParams>,
    pub records: Vec<TrainingRecord>,
    pub max_length: Option<usize>,
}

/// Backend whose behavior is scripted per stage.
#[derive(Debug, Default)]
pub struct FakeBackend {
    /// Stage whose backend call returns an error.
    pub fail_at: Option<StageId>,
    /// Stage whose backend call panics.
    pub panic_at: Option<StageId>,
    /// Train until the callback asks to stop.
    pub hold_training: bool,
    pub seen: Mutex<Seen>,
}

impl FakeBackend {
    pub fn failing_at(stage: StageId) -> Self {
        Self { fail_at: Some(stage), ..Self::default() }
    }

    pub fn panicking_at(stage: StageId) -> Self {
        Self { panic_at: Some(stage), ..Self::default() }
    }

    pub fn holding_training() -> Self {
        Self { hold_training: true, ..Self::default() }
    }

    pub fn seen(&self) -> Seen {
        self.seen.lock().unwrap().clone()
    }

    fn check(&self, stage: StageId) -> TrainingResult<()> {
        if self.panic_at == Some(stage) {
            panic!("fake backend panicked in {stage}");
        }
        if self.fail_at == Some(stage) {
            return Err(TrainingError::Backend(format!("fake failure in {stage}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TrainingBackend for FakeBackend {
    fn id(&self) -> &'static str {
        "fake"
    }

    async fn detect_device(&self) -> TrainingResult<DeviceKind> {
        self.check(StageId::DetectDevice)?;
        Ok(DeviceKind::Cuda)
    }

    async fn import_runtime(&self, reporter: &dyn StageReporter) -> TrainingResult<()> {
        self.check(StageId::ImportRuntime)?;
        reporter.report_progress(100);
        Ok(())
    }

    async fn load_model(
        &self,
        model_id: &str,
        device: DeviceKind,
        _quantization: &QuantizationParams,
        _reporter: &dyn StageReporter,
    ) -> TrainingResult<LoadedModel> {
        self.check(StageId::LoadModel)?;
        self.seen.lock().unwrap().device = Some(device);
        Ok(LoadedModel { model: Opaque::new(model_id, ()), tokenizer: Opaque::new("tok", ()) })
    }

    async fn attach_adapter(
        &self,
        model: ModelHandle,
        params: &AdapterParams,
        _reporter: &dyn StageReporter,
    ) -> TrainingResult<ModelHandle> {
        self.check(StageId::SetupAdapter)?;
        self.seen.lock().unwrap().adapter = Some(params.clone());
        Ok(model)
    }

    async fn tokenize(
        &self,
        records: RecordStream,
        _tokenizer: &TokenizerHandle,
        max_length: usize,
        cache_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<DatasetHandle> {
        self.check(StageId::Tokenize)?;
        let records: Vec<TrainingRecord> = tokio::task::spawn_blocking(move || records.collect())
            .await
            .map_err(|e| TrainingError::Backend(e.to_string()))?;
        std::fs::create_dir_all(cache_dir)?;
        std::fs::write(cache_dir.join("tokens.bin"), records.len().to_string())?;
        reporter.report_progress(100);

        let mut seen = self.seen.lock().unwrap();
        seen.max_length = Some(max_length);
        seen.records.clone_from(&records);
        Ok(Opaque::new("dataset", records.len()))
    }

    async fn train(&self, request: TrainRequest<'_>, callback: &dyn TrainingCallback) -> TrainingResult<PathBuf> {
        self.check(StageId::Train)?;
        self.seen.lock().unwrap().training = Some(request.params.clone());

        let total = if self.hold_training { 1_000_000 } else { 4 };
        callback.on_train_begin(total);
        for step in 1..=total {
            if callback.on_step(step, total) {
                return Err(TrainingError::Stopped);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let dir = request.output_dir.join("final_model");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("adapter.bin"), "adapter")?;
        Ok(dir)
    }

    async fn merge_adapter(
        &self,
        adapter_path: &Path,
        _model_id: &str,
        output_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<PathBuf> {
        self.check(StageId::MergeAdapter)?;
        let dir = output_dir.join("merged_model");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("source.txt"), adapter_path.display().to_string())?;
        reporter.report_progress(100);
        Ok(dir)
    }
}

/// A temporary projects directory with fake external tools.
pub struct Fixture {
    pub temp: TempDir,
    pub config: EngineConfig,
}

impl Fixture {
    /// Projects dir with a llama.cpp directory that has no conversion script.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let tools = temp.path().join("llama.cpp");
        std::fs::create_dir_all(&tools).unwrap();
        let config = EngineConfig {
            projects_dir: temp.path().join("projects"),
            llama_cpp_dir: tools,
            python: "sh".to_string(),
            ollama: "forge-no-such-ollama".to_string(),
            ingest_pacing: Duration::ZERO,
            active_poll: Duration::from_millis(10),
            idle_poll: Duration::from_millis(30),
        };
        std::fs::create_dir_all(config.project_root(PROJECT).join("data")).unwrap();
        Self { temp, config }
    }

    /// Installs a conversion script that writes its `--outfile` argument.
    pub fn with_converter(self) -> Self {
        std::fs::write(
            self.config.llama_cpp_dir.join(forge_orchestrator::convert::CONVERT_SCRIPT),
            "printf 'gguf %s' \"$5\" > \"$3\"\n",
        )
        .unwrap();
        self
    }

    pub fn project_root(&self) -> PathBuf {
        self.config.project_root(PROJECT)
    }

    pub fn write_data(&self, filename: &str, content: &str) {
        std::fs::write(self.project_root().join("data").join(filename), content).unwrap();
    }

    pub fn write_project_file(&self, json: &str) {
        std::fs::write(self.project_root().join("project.json"), json).unwrap();
    }

    /// Service whose converter only searches the fixture's llama.cpp directory.
    pub fn service(&self, backend: Arc<FakeBackend>) -> TrainingService {
        let orchestrator = Orchestrator::new(backend, &self.config).with_converter(FormatConverter::with_search_dirs(
            self.config.python.clone(),
            vec![self.config.llama_cpp_dir.clone()],
        ));
        TrainingService::with_orchestrator(orchestrator, self.config.clone())
    }
}

pub fn request(files: &[&str]) -> StartJobRequest {
    StartJobRequest::new(PROJECT, "tiny-llama", files.iter().map(ToString::to_string).collect())
}

pub fn rows(n: usize) -> String {
    (0..n).map(|_| format!("{VALID_ROW}\n")).collect()
}

/// Waits for the job to finish, failing the test on timeout.
pub async fn finish(job: &TrainingJob) -> JobState {
    tokio::time::timeout(WAIT, job.wait_terminal()).await.expect("job did not finish in time")
}

/// Waits until `predicate` holds for the job state.
pub async fn wait_until(job: &TrainingJob, predicate: impl Fn(&JobState) -> bool) -> JobState {
    let mut rx = job.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s)))
        .await
        .expect("condition not reached in time")
        .expect("job state channel closed");
    state.clone()
}
