use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for a training job: the first 16 hex chars of a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        let mut hex = Uuid::new_v4().simple().to_string();
        hex.truncate(16);
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Compute device a job trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cuda,
    Mps,
    #[default]
    Cpu,
}

impl DeviceKind {
    #[must_use]
    pub fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device '{other}' (expected cuda, mps or cpu)")),
        }
    }
}

/// Classification attached to a job that did not complete, or to a rejected start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyRunning,
    NoDataFiles,
    DataFileNotFound,
    ImportFailed,
    ModelLoadFailed,
    TrainingFailed,
    ExportFailed,
    ConversionToolMissing,
    ConversionFailed,
    RegistrationFailed,
    Cancelled,
    Unexpected,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::NoDataFiles => "no_data_files",
            Self::DataFileNotFound => "data_file_not_found",
            Self::ImportFailed => "import_failed",
            Self::ModelLoadFailed => "model_load_failed",
            Self::TrainingFailed => "training_failed",
            Self::ExportFailed => "export_failed",
            Self::ConversionToolMissing => "conversion_tool_missing",
            Self::ConversionFailed => "conversion_failed",
            Self::RegistrationFailed => "registration_failed",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
