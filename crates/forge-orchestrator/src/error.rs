// Error types for orchestration

use forge_training::{ErrorCode, StageId};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Failure of a single stage, carrying the code the job terminates with.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A stage failed with a classified error
    #[error("Stage '{stage}' failed ({code}): {message}")]
    StageFailed {
        /// Stage that failed
        stage: StageId,
        /// Terminal classification
        code: ErrorCode,
        /// Human-readable cause
        message: String,
    },

    /// A stage panicked
    #[error("Stage '{0}' panicked: {1}")]
    Panicked(StageId, String),

    /// The job state rejected a transition
    #[error("Invalid transition at stage '{0}' from status '{1}'")]
    InvalidTransition(StageId, forge_training::JobStatus),
}

impl OrchestrationError {
    /// Builds a stage failure classified with the stage's default code.
    pub fn stage(stage: StageId, error: impl std::fmt::Display) -> Self {
        Self::StageFailed { stage, code: default_code(stage), message: error.to_string() }
    }

    /// Builds a stage failure with an explicit code.
    pub fn classified(stage: StageId, code: ErrorCode, error: impl std::fmt::Display) -> Self {
        Self::StageFailed { stage, code, message: error.to_string() }
    }

    /// Code the job terminates with.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StageFailed { code, .. } => *code,
            Self::Panicked(..) | Self::InvalidTransition(..) => ErrorCode::Unexpected,
        }
    }
}

/// Default error classification of each stage.
#[must_use]
pub fn default_code(stage: StageId) -> ErrorCode {
    match stage {
        StageId::DetectDevice => ErrorCode::Unexpected,
        StageId::ImportRuntime => ErrorCode::ImportFailed,
        StageId::LoadModel => ErrorCode::ModelLoadFailed,
        StageId::SetupAdapter | StageId::Tokenize | StageId::Train => ErrorCode::TrainingFailed,
        StageId::MergeAdapter => ErrorCode::ExportFailed,
        StageId::ConvertFormat => ErrorCode::ConversionFailed,
        StageId::RegisterModel => ErrorCode::RegistrationFailed,
    }
}

/// Rejection of a `start_job` request. No job is registered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("no data files were supplied")]
    NoDataFiles,

    #[error("data file not found: {0}")]
    DataFileNotFound(String),

    #[error("a training job is already running for project '{0}'")]
    AlreadyRunning(String),
}

impl StartError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoDataFiles => ErrorCode::NoDataFiles,
            Self::DataFileNotFound(_) => ErrorCode::DataFileNotFound,
            Self::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
        }
    }
}

/// Failure of the format conversion tool.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("conversion script convert_hf_to_gguf.py not found (searched: {0})")]
    ScriptMissing(String),

    #[error("python interpreter '{0}' not found")]
    InterpreterMissing(String),

    #[error("conversion failed: {0}")]
    Failed(String),

    #[error("conversion finished but {0} was not created")]
    OutputMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ScriptMissing(_) | Self::InterpreterMissing(_) => ErrorCode::ConversionToolMissing,
            Self::Failed(_) | Self::OutputMissing(_) | Self::Io(_) => ErrorCode::ConversionFailed,
        }
    }
}

/// Failure of the model-runtime registrar.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("invalid model name '{0}'")]
    InvalidName(String),

    #[error("registrar binary '{0}' not found")]
    BinaryMissing(String),

    #[error("registrar command failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_table() {
        assert_eq!(default_code(StageId::ImportRuntime), ErrorCode::ImportFailed);
        assert_eq!(default_code(StageId::LoadModel), ErrorCode::ModelLoadFailed);
        assert_eq!(default_code(StageId::SetupAdapter), ErrorCode::TrainingFailed);
        assert_eq!(default_code(StageId::Tokenize), ErrorCode::TrainingFailed);
        assert_eq!(default_code(StageId::Train), ErrorCode::TrainingFailed);
        assert_eq!(default_code(StageId::MergeAdapter), ErrorCode::ExportFailed);
        assert_eq!(default_code(StageId::ConvertFormat), ErrorCode::ConversionFailed);
        assert_eq!(default_code(StageId::RegisterModel), ErrorCode::RegistrationFailed);
    }

    #[test]
    fn test_convert_error_codes() {
        assert_eq!(ConvertError::ScriptMissing("x".into()).code(), ErrorCode::ConversionToolMissing);
        assert_eq!(
            ConvertError::Failed("exit code 1".into()).code(),
            ErrorCode::ConversionFailed
        );
        assert_eq!(OrchestrationError::Panicked(StageId::Train, "boom".into()).code(), ErrorCode::Unexpected);
    }
}
