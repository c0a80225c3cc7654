//! The capability trait the orchestrator delegates numerical work to.

use crate::config::{AdapterParams, QuantizationParams, TrainingParams};
use crate::error::TrainingResult;
use crate::ingest::RecordStream;
use crate::job::DeviceKind;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Type-erased value produced by one backend call and consumed by a later one.
///
/// The orchestrator only passes handles along; the backend that created a
/// handle downcasts it back to its concrete type.
#[derive(Clone)]
pub struct Opaque {
    label: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, value: T) -> Self {
        Self { label: label.into(), value: Arc::new(value) }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque").field("label", &self.label).finish_non_exhaustive()
    }
}

pub type ModelHandle = Opaque;
pub type TokenizerHandle = Opaque;
pub type DatasetHandle = Opaque;

/// Result of loading a base model.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub model: ModelHandle,
    pub tokenizer: TokenizerHandle,
}

/// Handed to every backend call: progress reporting and the job's cancellation token.
pub trait StageReporter: Send + Sync {
    /// Reports progress of the current call in percent; values above 100 are clamped.
    fn report_progress(&self, percent: u8);

    fn cancellation(&self) -> &CancellationToken;

    fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }
}

/// Hooks invoked by the backend's training loop.
pub trait TrainingCallback: Send + Sync {
    fn on_train_begin(&self, total_steps: u64);

    /// Called after each optimizer step. Returns `true` when training should stop.
    fn on_step(&self, step: u64, total_steps: u64) -> bool;
}

/// Inputs for the training pass.
pub struct TrainRequest<'a> {
    pub model: &'a ModelHandle,
    pub tokenizer: &'a TokenizerHandle,
    pub dataset: &'a DatasetHandle,
    pub params: &'a TrainingParams,
    pub device: DeviceKind,
    /// Directory the adapter checkpoint is written to.
    pub output_dir: &'a Path,
    pub reporter: &'a dyn StageReporter,
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn id(&self) -> &'static str;

    async fn detect_device(&self) -> TrainingResult<DeviceKind>;

    /// Makes the numerical runtime available.
    async fn import_runtime(&self, reporter: &dyn StageReporter) -> TrainingResult<()>;

    async fn load_model(
        &self,
        model_id: &str,
        device: DeviceKind,
        quantization: &QuantizationParams,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<LoadedModel>;

    /// Attaches a low-rank adapter and returns the trainable model.
    async fn attach_adapter(
        &self,
        model: ModelHandle,
        params: &AdapterParams,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<ModelHandle>;

    /// Tokenizes records pulled lazily from `records`.
    ///
    /// Progress reported here covers this pass only (0..=100); ingestion
    /// progress is tracked separately by the caller. Scratch data may be written
    /// under `cache_dir`.
    async fn tokenize(
        &self,
        records: RecordStream,
        tokenizer: &TokenizerHandle,
        max_length: usize,
        cache_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<DatasetHandle>;

    /// Runs training and returns the adapter checkpoint path.
    async fn train(
        &self,
        request: TrainRequest<'_>,
        callback: &dyn TrainingCallback,
    ) -> TrainingResult<PathBuf>;

    /// Merges the adapter into the base model and returns the merged weights directory.
    async fn merge_adapter(
        &self,
        adapter_path: &Path,
        model_id: &str,
        output_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_downcast() {
        let handle = Opaque::new("vocab", vec!['a', 'b']);
        assert_eq!(handle.label(), "vocab");
        assert_eq!(handle.downcast_ref::<Vec<char>>().map(Vec::len), Some(2));
        assert!(handle.downcast_ref::<String>().is_none());

        let cloned = handle.clone();
        assert!(format!("{cloned:?}").contains("vocab"));
    }
}
