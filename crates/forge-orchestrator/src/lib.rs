//! Forge Orchestrator
//!
//! Runs fine-tuning jobs through a fixed nine-stage pipeline: device
//! detection, runtime import, model loading, adapter setup, tokenization,
//! training, adapter merge, format conversion and model registration.
//!
//! [`TrainingService`] is the entry point. It admits at most one active job
//! per project, executes each job on its own tokio task and exposes status
//! snapshots, cancellation and a progress stream.

pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod job;
pub mod modelfile;
mod process;
pub mod progress;
pub mod registrar;
pub mod registry;
pub mod service;

pub use config::{EngineConfig, EngineSettings};
pub use convert::FormatConverter;
pub use error::{ConfigError, ConvertError, OrchestrationError, RegistrarError, Result, StartError};
pub use executor::Orchestrator;
pub use job::{JobSpec, JobWriter, TrainingJob};
pub use progress::{PollIntervals, ProgressUpdate, StatusResponse};
pub use registrar::{OllamaRegistrar, RegisteredModel};
pub use registry::JobRegistry;
pub use service::{CancelOutcome, StartJobRequest, TrainingService};
