//! Job status vocabulary and transition rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall status of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, worker not yet started.
    #[default]
    Idle,
    /// Worker started, no stage entered yet.
    Starting,
    LoadingData,
    LoadingModel,
    Training,
    Exporting,
    Converting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses during which a job counts as running.
    pub const ACTIVE: [Self; 6] = [
        Self::Starting,
        Self::LoadingData,
        Self::LoadingModel,
        Self::Training,
        Self::Exporting,
        Self::Converting,
    ];

    #[must_use]
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::LoadingData => "loading_data",
            Self::LoadingModel => "loading_model",
            Self::Training => "training",
            Self::Exporting => "exporting",
            Self::Converting => "converting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Checks if a job can move from this status to `to`.
    ///
    /// Terminal statuses are final. Active phases may follow each other in any
    /// order because the tokenize stage re-enters `LoadingData` after the model
    /// has been loaded.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            // Same status is always valid
            (a, b) if a == b => true,
            // Nothing leaves a terminal status
            (a, _) if a.is_terminal() => false,
            // From Idle: the worker starts, or the job ends before any stage ran
            (Self::Idle, Self::Starting | Self::Failed | Self::Cancelled) => true,
            (Self::Idle, _) => false,
            // Back to Idle or Starting is never valid once running
            (_, Self::Idle | Self::Starting) => false,
            // Active phases move freely between each other and into any terminal status
            _ => true,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
