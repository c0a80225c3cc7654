//! Progress publishing: status snapshots and the push stream.

use crate::registry::JobRegistry;
use forge_training::{DeviceKind, ErrorCode, FileStatus, JobId, JobState, JobStatus, StageId, StageProgress};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Serializable status of a project's most recent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub project: String,
    /// Absent when no job was ever started for the project.
    pub job_id: Option<JobId>,
    pub status: JobStatus,
    pub progress: f64,
    pub current_step: u64,
    pub total_steps: u64,
    pub device: Option<DeviceKind>,
    pub error_code: Option<ErrorCode>,
    pub can_start: bool,
    pub stages: Vec<StageProgress>,
    pub files: Vec<FileStatus>,
}

impl StatusResponse {
    /// Payload for a project without a job.
    #[must_use]
    pub fn idle(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            job_id: None,
            status: JobStatus::Idle,
            progress: 0.0,
            current_step: 0,
            total_steps: 0,
            device: None,
            error_code: None,
            can_start: true,
            stages: StageId::ALL.into_iter().map(StageProgress::new).collect(),
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_state(project: impl Into<String>, state: JobState) -> Self {
        Self {
            project: project.into(),
            can_start: state.can_start(),
            job_id: Some(state.job_id),
            status: state.status,
            progress: state.progress,
            current_step: state.current_step,
            total_steps: state.total_steps,
            device: state.device,
            error_code: state.error_code,
            stages: state.stages,
            files: state.files,
        }
    }

    /// Current status of `project` in `registry`.
    #[must_use]
    pub fn for_project(registry: &JobRegistry, project: &str) -> Self {
        registry
            .get_job(project)
            .map_or_else(|| Self::idle(project), |job| Self::from_state(project, job.snapshot()))
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One message of the progress stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressUpdate {
    /// No job exists for the project.
    Status(StatusResponse),
    Progress(StatusResponse),
    /// Follows every terminal `progress` message.
    Done(StatusResponse),
}

impl ProgressUpdate {
    #[must_use]
    pub fn status(&self) -> &StatusResponse {
        match self {
            Self::Status(s) | Self::Progress(s) | Self::Done(s) => s,
        }
    }
}

/// Polling intervals of the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub active: Duration,
    pub idle: Duration,
}

struct Poller {
    registry: Arc<JobRegistry>,
    project: String,
    intervals: PollIntervals,
    delay: Duration,
    pending_done: Option<StatusResponse>,
}

impl Poller {
    async fn next(mut self) -> (ProgressUpdate, Self) {
        if let Some(done) = self.pending_done.take() {
            return (ProgressUpdate::Done(done), self);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let update = match self.registry.get_job(&self.project) {
            None => {
                self.delay = self.intervals.idle;
                ProgressUpdate::Status(StatusResponse::idle(&self.project))
            }
            Some(job) => {
                let status = StatusResponse::from_state(&self.project, job.snapshot());
                self.delay = if status.is_terminal() { self.intervals.idle } else { self.intervals.active };
                if status.is_terminal() {
                    self.pending_done = Some(status.clone());
                }
                ProgressUpdate::Progress(status)
            }
        };
        debug!(project = %self.project, status = %update.status().status, "Polled job snapshot");
        (update, self)
    }
}

/// Stream of progress updates for `project`.
///
/// The first update is emitted immediately. The stream never ends on its own,
/// so a job started later for the same project is picked up; dropping the
/// stream disconnects.
pub fn subscribe(
    registry: Arc<JobRegistry>,
    project: String,
    intervals: PollIntervals,
) -> impl Stream<Item = ProgressUpdate> + Send + 'static {
    let poller = Poller { registry, project, intervals, delay: Duration::ZERO, pending_done: None };
    futures::stream::unfold(poller, |poller| async move { Some(poller.next().await) })
}
