//! The fixed, ordered stage catalog.

use crate::lifecycle::JobStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one of the nine pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    DetectDevice,
    ImportRuntime,
    LoadModel,
    SetupAdapter,
    Tokenize,
    Train,
    MergeAdapter,
    ConvertFormat,
    RegisterModel,
}

impl StageId {
    pub const COUNT: usize = 9;

    /// Every stage in catalog order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::DetectDevice,
        Self::ImportRuntime,
        Self::LoadModel,
        Self::SetupAdapter,
        Self::Tokenize,
        Self::Train,
        Self::MergeAdapter,
        Self::ConvertFormat,
        Self::RegisterModel,
    ];

    /// Position of the stage in the catalog.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DetectDevice => "detect_device",
            Self::ImportRuntime => "import_runtime",
            Self::LoadModel => "load_model",
            Self::SetupAdapter => "setup_adapter",
            Self::Tokenize => "tokenize",
            Self::Train => "train",
            Self::MergeAdapter => "merge_adapter",
            Self::ConvertFormat => "convert_format",
            Self::RegisterModel => "register_model",
        }
    }

    /// Job status a job enters while this stage runs.
    ///
    /// `RegisterModel` is bookkeeping only and leaves the status untouched.
    #[must_use]
    pub fn phase(self) -> Option<JobStatus> {
        match self {
            Self::DetectDevice | Self::ImportRuntime | Self::Tokenize => Some(JobStatus::LoadingData),
            Self::LoadModel | Self::SetupAdapter => Some(JobStatus::LoadingModel),
            Self::Train => Some(JobStatus::Training),
            Self::MergeAdapter => Some(JobStatus::Exporting),
            Self::ConvertFormat => Some(JobStatus::Converting),
            Self::RegisterModel => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a stage, also used for per-file ingestion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Pending or in progress.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }
}
