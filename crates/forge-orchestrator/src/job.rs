//! Job handle and writer.
//!
//! A job's state lives in a `tokio::sync::watch` channel. The worker task owns
//! the only [`JobWriter`] and mutates the state in place; every other party
//! holds a [`TrainingJob`] and reads cloned snapshots.

use chrono::{DateTime, Utc};
use forge_training::{ConfigOverrides, JobId, JobState, JobStatus, ProjectLayout, StageId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Immutable inputs of a job, fixed at construction.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub project: String,
    pub layout: ProjectLayout,
    pub model_id: String,
    /// Input filenames in the order supplied; duplicates are tracked separately.
    pub filenames: Vec<String>,
    /// Requested export variant, e.g. `q8_0`.
    pub format_variant: String,
    /// Name to register the finished model under, if any.
    pub target_name: Option<String>,
    pub overrides: ConfigOverrides,
    pub created_at: DateTime<Utc>,
}

/// Read handle of a training job.
#[derive(Debug)]
pub struct TrainingJob {
    id: JobId,
    spec: JobSpec,
    state: watch::Receiver<JobState>,
    cancel: CancellationToken,
}

impl TrainingJob {
    /// Creates a job in `idle` together with its single writer.
    #[must_use]
    pub fn new(spec: JobSpec) -> (Arc<Self>, JobWriter) {
        let id = JobId::new();
        let (tx, rx) = watch::channel(JobState::new(id.clone(), &spec.filenames));
        let job = Arc::new(Self { id: id.clone(), spec, state: rx, cancel: CancellationToken::new() });
        (job, JobWriter { id, tx: Arc::new(tx) })
    }

    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    #[must_use]
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Consistent point-in-time copy of the job state.
    #[must_use]
    pub fn snapshot(&self) -> JobState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.borrow().status
    }

    /// True while the worker is executing stages.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status().is_active()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cooperative cancellation.
    ///
    /// Returns `false` if the job already reached a terminal status.
    pub fn cancel(&self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Waits until the job reaches a terminal status and returns that snapshot.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

/// The single writer of a job's state.
#[derive(Debug, Clone)]
pub struct JobWriter {
    id: JobId,
    tx: Arc<watch::Sender<JobState>>,
}

impl JobWriter {
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.id
    }

    /// Applies `f` to the state and notifies readers.
    pub fn update(&self, f: impl FnOnce(&mut JobState)) {
        self.tx.send_modify(f);
    }

    #[must_use]
    pub fn snapshot(&self) -> JobState {
        self.tx.borrow().clone()
    }

    pub fn transition(&self, to: JobStatus) -> Result<JobStatus, JobStatus> {
        let mut outcome = Err(to);
        self.tx.send_modify(|s| outcome = s.transition(to));
        outcome
    }

    pub fn begin_stage(&self, stage: StageId) -> Result<(), JobStatus> {
        let mut outcome = Ok(());
        self.tx.send_modify(|s| outcome = s.begin_stage(stage));
        outcome
    }

    /// Completes `stage` and begins `next` in a single notification, so
    /// readers never observe a gap between stages.
    pub fn advance(&self, stage: StageId, next: Option<StageId>) -> Result<(), JobStatus> {
        let mut outcome = Ok(());
        self.tx.send_modify(|s| {
            s.complete_stage(stage);
            if let Some(next) = next {
                outcome = s.begin_stage(next);
            }
        });
        outcome
    }

    /// Sets stage progress, ignoring values below the current one.
    pub fn raise_stage_progress(&self, stage: StageId, percent: u8) {
        self.tx.send_if_modified(|s| {
            if percent > s.stage(stage).progress {
                s.set_stage_progress(stage, percent);
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_training::StageStatus;

    fn spec(files: &[&str]) -> JobSpec {
        JobSpec {
            project: "demo".to_string(),
            layout: ProjectLayout::new(std::env::temp_dir().join("forge-job-test")),
            model_id: "tiny".to_string(),
            filenames: files.iter().map(ToString::to_string).collect(),
            format_variant: "q8_0".to_string(),
            target_name: None,
            overrides: ConfigOverrides::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_reader_sees_writer_updates() {
        let (job, writer) = TrainingJob::new(spec(&["a.jsonl", "b.jsonl"]));
        assert_eq!(job.status(), JobStatus::Idle);
        assert_eq!(job.snapshot().job_id, *job.id());

        writer.transition(JobStatus::Starting).unwrap();
        writer.begin_stage(StageId::DetectDevice).unwrap();
        writer.update(|s| s.file_started(1));

        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::LoadingData);
        assert!(job.is_running());
        assert_eq!(snap.stage(StageId::DetectDevice).status, StageStatus::InProgress);
        assert_eq!(snap.files[1].status, StageStatus::InProgress);
        assert_eq!(snap.files[0].filename, "a.jsonl");
    }

    #[test]
    fn test_raise_stage_progress_is_monotonic() {
        let (job, writer) = TrainingJob::new(spec(&[]));
        writer.raise_stage_progress(StageId::Tokenize, 60);
        writer.raise_stage_progress(StageId::Tokenize, 40);
        assert_eq!(job.snapshot().stage(StageId::Tokenize).progress, 60);
    }

    #[test]
    fn test_cancel_is_refused_once_terminal() {
        let (job, writer) = TrainingJob::new(spec(&[]));
        writer.transition(JobStatus::Starting).unwrap();
        assert!(job.cancel());
        assert!(job.is_cancelled());

        let (done, writer) = TrainingJob::new(spec(&[]));
        writer.update(JobState::complete);
        assert!(!done.cancel());
        assert!(!done.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_terminal_returns_final_snapshot() {
        let (job, writer) = TrainingJob::new(spec(&[]));
        let waiter = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.wait_terminal().await })
        };
        writer.transition(JobStatus::Starting).unwrap();
        writer.update(JobState::cancel);

        let state = waiter.await.unwrap();
        assert_eq!(state.status, JobStatus::Cancelled);
    }
}
