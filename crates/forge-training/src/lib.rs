//! Forge Training
//!
//! Backend-agnostic primitives for fine-tuning jobs:
//! - The fixed stage catalog and job vocabulary (`StageId`, `JobStatus`, `ErrorCode`)
//! - Configuration overrides, defaults and effective resolution
//! - Training records, row validation and streaming file ingestion
//! - The mutable job state shared between the orchestrator and its readers
//! - The `TrainingBackend` capability trait and a minimal local backend

pub mod backend;
pub mod bigram;
pub mod config;
pub mod dataset;
pub mod error;
pub mod ingest;
pub mod job;
pub mod layout;
pub mod lifecycle;
pub mod progress;
pub mod stage;

pub use backend::{
    DatasetHandle, LoadedModel, ModelHandle, Opaque, StageReporter, TokenizerHandle, TrainRequest,
    TrainingBackend, TrainingCallback,
};
pub use bigram::BigramBackend;
pub use config::{
    AdapterOverrides, AdapterParams, ConfigOverrides, ModelfileOverrides, ModelfileParams,
    QuantizationOverrides, QuantizationParams, TrainingOverrides, TrainingParams,
};
pub use dataset::{DatasetId, ParsedLine, RowRejection, TrainingRecord, compute_dataset_id, parse_line};
pub use error::{TrainingError, TrainingResult};
pub use ingest::{IngestObserver, IngestReport, IngestSource, RecordStream};
pub use job::{DeviceKind, ErrorCode, JobId};
pub use layout::ProjectLayout;
pub use lifecycle::JobStatus;
pub use progress::{FileStatus, JobState, StageProgress};
pub use stage::{StageId, StageStatus};
