use crate::backend::{
    DatasetHandle, LoadedModel, ModelHandle, Opaque, StageReporter, TokenizerHandle, TrainRequest,
    TrainingBackend, TrainingCallback,
};
use crate::config::{AdapterParams, QuantizationParams};
use crate::dataset::{DatasetId, TrainingRecord, compute_dataset_id};
use crate::error::{TrainingError, TrainingResult};
use crate::ingest::RecordStream;
use crate::job::DeviceKind;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

const CHECKPOINT_FILE: &str = "bigram_checkpoint.json";
const MANIFEST_FILE: &str = "merge_manifest.json";

/// A minimal local backend that fits a character-level bigram table.
///
/// Runs on the CPU without any numerical runtime, so the whole pipeline can
/// be exercised end to end.
#[derive(Debug, Clone, Default)]
pub struct BigramBackend;

impl BigramBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
struct BaseModel {
    model_id: String,
}

#[derive(Debug, Clone)]
struct AdaptedModel {
    base: BaseModel,
    rank: u32,
}

#[derive(Debug, Clone)]
struct CharTokenizer;

#[derive(Debug, Clone)]
struct BigramDataset {
    id: DatasetId,
    texts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BigramCheckpoint {
    base_model: String,
    rank: u32,
    dataset_id: String,
    vocab: Vec<String>,
    transitions: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct MergeManifest<'a> {
    base_model: &'a str,
    adapter: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct BigramCounts {
    pairs: HashMap<(char, char), f32>,
    vocab: BTreeSet<char>,
}

impl BigramCounts {
    fn observe(&mut self, text: &str) {
        let mut prev: Option<char> = None;
        for ch in text.chars() {
            self.vocab.insert(ch);
            if let Some(p) = prev {
                *self.pairs.entry((p, ch)).or_insert(0.0) += 1.0;
            }
            prev = Some(ch);
        }
    }

    fn into_checkpoint(self, base_model: String, rank: u32, dataset_id: String) -> TrainingResult<BigramCheckpoint> {
        if self.vocab.is_empty() {
            return Err(TrainingError::Backend("vocab is empty".to_string()));
        }
        let vocab: Vec<char> = self.vocab.into_iter().collect();

        // Laplace smoothing
        let transitions = vocab
            .iter()
            .map(|a| vocab.iter().map(|b| 1.0 + self.pairs.get(&(*a, *b)).copied().unwrap_or(0.0)).collect())
            .collect();

        Ok(BigramCheckpoint {
            base_model,
            rank,
            dataset_id,
            vocab: vocab.into_iter().map(|c| c.to_string()).collect(),
            transitions,
        })
    }
}

fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> TrainingResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn downcast<'a, T: 'static>(handle: &'a Opaque, what: &str) -> TrainingResult<&'a T> {
    handle
        .downcast_ref::<T>()
        .ok_or_else(|| TrainingError::Backend(format!("{what} handle '{}' was not created by the bigram backend", handle.label())))
}

#[async_trait]
impl TrainingBackend for BigramBackend {
    fn id(&self) -> &'static str {
        "bigram"
    }

    async fn detect_device(&self) -> TrainingResult<DeviceKind> {
        Ok(DeviceKind::Cpu)
    }

    async fn import_runtime(&self, reporter: &dyn StageReporter) -> TrainingResult<()> {
        reporter.report_progress(100);
        Ok(())
    }

    async fn load_model(
        &self,
        model_id: &str,
        _device: DeviceKind,
        _quantization: &QuantizationParams,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<LoadedModel> {
        if model_id.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("model id must not be empty".to_string()));
        }
        reporter.report_progress(50);
        let model = BaseModel { model_id: model_id.to_string() };
        reporter.report_progress(100);
        Ok(LoadedModel {
            model: Opaque::new(model_id, model),
            tokenizer: Opaque::new("char", CharTokenizer),
        })
    }

    async fn attach_adapter(
        &self,
        model: ModelHandle,
        params: &AdapterParams,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<ModelHandle> {
        let base = downcast::<BaseModel>(&model, "model")?.clone();
        reporter.report_progress(100);
        let label = format!("{}+lora(r={})", model.label(), params.r);
        Ok(Opaque::new(label, AdaptedModel { base, rank: params.r }))
    }

    async fn tokenize(
        &self,
        records: RecordStream,
        tokenizer: &TokenizerHandle,
        max_length: usize,
        cache_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<DatasetHandle> {
        downcast::<CharTokenizer>(tokenizer, "tokenizer")?;

        let records: Vec<TrainingRecord> = tokio::task::spawn_blocking(move || records.collect())
            .await
            .map_err(|e| TrainingError::Backend(format!("tokenizer task failed: {e}")))?;
        reporter.report_progress(50);

        let texts = records
            .iter()
            .map(|r| r.to_prompt().chars().take(max_length).collect::<String>())
            .collect::<Vec<_>>();
        let id = compute_dataset_id(&records)?;

        std::fs::create_dir_all(cache_dir)?;
        let mut jsonl = String::new();
        for text in &texts {
            jsonl.push_str(&serde_json::to_string(text)?);
            jsonl.push('\n');
        }
        std::fs::write(cache_dir.join("tokenized.jsonl"), jsonl)?;
        reporter.report_progress(100);

        Ok(Opaque::new(id.0.clone(), BigramDataset { id, texts }))
    }

    async fn train(
        &self,
        request: TrainRequest<'_>,
        callback: &dyn TrainingCallback,
    ) -> TrainingResult<PathBuf> {
        let model = downcast::<AdaptedModel>(request.model, "model")?;
        let dataset = downcast::<BigramDataset>(request.dataset, "dataset")?;
        if dataset.texts.is_empty() {
            return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
        }

        let batch = request.params.per_device_train_batch_size.max(1) as usize;
        let epochs = u64::from(request.params.num_train_epochs.max(1));
        let steps_per_epoch = dataset.texts.len().div_ceil(batch) as u64;
        let total = steps_per_epoch * epochs;
        callback.on_train_begin(total);

        let mut counts = BigramCounts::default();
        let mut step = 0;
        for _ in 0..epochs {
            for chunk in dataset.texts.chunks(batch) {
                for text in chunk {
                    counts.observe(text);
                }
                step += 1;
                if callback.on_step(step, total) {
                    tracing::info!(step, total, "Training stopped by callback");
                    return Err(TrainingError::Stopped);
                }
                tokio::task::yield_now().await;
            }
        }

        let ckpt = counts.into_checkpoint(model.base.model_id.clone(), model.rank, dataset.id.0.clone())?;
        let final_dir = request.output_dir.join("final_model");
        std::fs::create_dir_all(&final_dir)?;
        write_json(final_dir.join(CHECKPOINT_FILE), &ckpt)?;
        Ok(final_dir)
    }

    async fn merge_adapter(
        &self,
        adapter_path: &Path,
        model_id: &str,
        output_dir: &Path,
        reporter: &dyn StageReporter,
    ) -> TrainingResult<PathBuf> {
        let raw = std::fs::read_to_string(adapter_path.join(CHECKPOINT_FILE))?;
        let ckpt: BigramCheckpoint = serde_json::from_str(&raw)?;
        reporter.report_progress(40);

        let merged = output_dir.join("merged_model");
        std::fs::create_dir_all(&merged)?;
        write_json(merged.join(CHECKPOINT_FILE), &ckpt)?;
        write_json(
            merged.join(MANIFEST_FILE),
            &MergeManifest {
                base_model: model_id,
                adapter: adapter_path.display().to_string(),
                created_at: chrono::Utc::now(),
            },
        )?;
        reporter.report_progress(100);
        Ok(merged)
    }
}
