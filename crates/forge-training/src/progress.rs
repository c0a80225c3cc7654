//! Mutable state of a job and the snapshot readers observe.
//!
//! `JobState` is plain data: every method is a pure state update, and the
//! orchestrator applies them through its single writer. Readers only ever
//! see cloned values.

use crate::job::{DeviceKind, ErrorCode, JobId};
use crate::lifecycle::JobStatus;
use crate::stage::{StageId, StageStatus};
use serde::{Deserialize, Serialize};

/// Progress of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub id: StageId,
    pub status: StageStatus,
    /// Percent, always within 0..=100.
    pub progress: u8,
    /// Non-fatal row errors recorded while the stage ran.
    pub error_count: u64,
}

impl StageProgress {
    #[must_use]
    pub fn new(id: StageId) -> Self {
        Self { id, status: StageStatus::Pending, progress: 0, error_count: 0 }
    }
}

/// Ingestion status of one input file, tracked by its position in the input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub filename: String,
    pub status: StageStatus,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
}

impl FileStatus {
    #[must_use]
    pub fn new(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), status: StageStatus::Pending, rows_loaded: 0, rows_skipped: 0 }
    }
}

/// Point-in-time state of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Overall percent, 0.0..=100.0.
    pub progress: f64,
    pub current_step: u64,
    pub total_steps: u64,
    pub device: Option<DeviceKind>,
    pub error_code: Option<ErrorCode>,
    pub stages: Vec<StageProgress>,
    pub files: Vec<FileStatus>,
}

impl JobState {
    /// Fresh `idle` state with every stage and file pending.
    #[must_use]
    pub fn new(job_id: JobId, filenames: &[String]) -> Self {
        Self {
            job_id,
            status: JobStatus::Idle,
            progress: 0.0,
            current_step: 0,
            total_steps: 0,
            device: None,
            error_code: None,
            stages: StageId::ALL.into_iter().map(StageProgress::new).collect(),
            files: filenames.iter().map(FileStatus::new).collect(),
        }
    }

    /// Whether a new job may replace this one.
    #[must_use]
    pub fn can_start(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn stage(&self, id: StageId) -> &StageProgress {
        &self.stages[id.index()]
    }

    fn stage_mut(&mut self, id: StageId) -> &mut StageProgress {
        &mut self.stages[id.index()]
    }

    /// Changes the overall status.
    ///
    /// Returns `Ok(previous)` on success, `Err(current)` if the transition is
    /// not allowed.
    pub fn transition(&mut self, to: JobStatus) -> Result<JobStatus, JobStatus> {
        let current = self.status;
        if !current.can_transition_to(to) {
            return Err(current);
        }
        self.status = to;
        Ok(current)
    }

    /// Marks `id` in progress and enters its phase status, if it has one.
    pub fn begin_stage(&mut self, id: StageId) -> Result<(), JobStatus> {
        if let Some(phase) = id.phase() {
            self.transition(phase)?;
        }
        let stage = self.stage_mut(id);
        stage.status = StageStatus::InProgress;
        stage.progress = 0;
        Ok(())
    }

    pub fn set_stage_progress(&mut self, id: StageId, percent: u8) {
        self.stage_mut(id).progress = percent.min(100);
    }

    pub fn increment_stage_errors(&mut self, id: StageId) {
        self.stage_mut(id).error_count += 1;
    }

    /// Marks `id` completed and recomputes overall progress from completed stages.
    pub fn complete_stage(&mut self, id: StageId) {
        let stage = self.stage_mut(id);
        stage.status = StageStatus::Completed;
        stage.progress = 100;
        self.progress = self.completed_stages() as f64 / StageId::COUNT as f64 * 100.0;
    }

    #[must_use]
    pub fn completed_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.status == StageStatus::Completed).count()
    }

    /// Fails the job at stage `id`; every later stage is skipped.
    pub fn fail_stage(&mut self, id: StageId, code: ErrorCode) {
        self.stage_mut(id).status = StageStatus::Failed;
        self.skip_open_stages();
        self.fail(code);
    }

    /// Fails the job outside any single stage's handling.
    pub fn fail(&mut self, code: ErrorCode) {
        for stage in &mut self.stages {
            if stage.status == StageStatus::InProgress {
                stage.status = StageStatus::Failed;
            }
        }
        self.skip_open_stages();
        self.status = JobStatus::Failed;
        self.error_code = Some(code);
    }

    /// Ends the job as cancelled: open stages and files become skipped.
    pub fn cancel(&mut self) {
        self.skip_open_stages();
        self.skip_open_files();
        self.status = JobStatus::Cancelled;
        self.error_code = Some(ErrorCode::Cancelled);
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
    }

    fn skip_open_stages(&mut self) {
        for stage in &mut self.stages {
            if stage.status.is_open() {
                stage.status = StageStatus::Skipped;
            }
        }
    }

    /// Marks every pending or in-progress file skipped.
    pub fn skip_open_files(&mut self) {
        for file in &mut self.files {
            if file.status.is_open() {
                file.status = StageStatus::Skipped;
            }
        }
    }

    pub fn file_started(&mut self, index: usize) {
        if let Some(file) = self.files.get_mut(index) {
            file.status = StageStatus::InProgress;
        }
    }

    pub fn file_row_loaded(&mut self, index: usize) {
        if let Some(file) = self.files.get_mut(index) {
            file.rows_loaded += 1;
        }
    }

    /// Records a non-fatal row rejection against the file and the tokenize stage.
    pub fn file_row_skipped(&mut self, index: usize) {
        if let Some(file) = self.files.get_mut(index) {
            file.rows_skipped += 1;
        }
        self.increment_stage_errors(StageId::Tokenize);
    }

    /// Marks a file that could not be read; counts as a tokenize error.
    pub fn file_failed(&mut self, index: usize) {
        if let Some(file) = self.files.get_mut(index) {
            file.status = StageStatus::Failed;
            file.rows_loaded = 0;
            file.rows_skipped = 0;
        }
        self.increment_stage_errors(StageId::Tokenize);
    }

    pub fn file_completed(&mut self, index: usize, rows_loaded: u64, rows_skipped: u64) {
        if let Some(file) = self.files.get_mut(index) {
            file.status = StageStatus::Completed;
            file.rows_loaded = rows_loaded;
            file.rows_skipped = rows_skipped;
        }
    }

    /// Files that reached a terminal status.
    #[must_use]
    pub fn files_done(&self) -> usize {
        self.files.iter().filter(|f| f.status.is_terminal()).count()
    }

    #[must_use]
    pub fn rows_loaded_total(&self) -> u64 {
        self.files.iter().map(|f| f.rows_loaded).sum()
    }

    pub fn set_steps(&mut self, current: u64, total: u64) {
        self.current_step = current;
        self.total_steps = total;
    }

    /// The stage currently in progress, if any.
    #[must_use]
    pub fn active_stage(&self) -> Option<StageId> {
        self.stages.iter().find(|s| s.status == StageStatus::InProgress).map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(files: &[&str]) -> JobState {
        let names: Vec<String> = files.iter().map(ToString::to_string).collect();
        JobState::new(JobId::new(), &names)
    }

    #[test]
    fn test_new_state_is_idle_and_pending() {
        let s = state(&["a.jsonl", "a.jsonl"]);
        assert_eq!(s.status, JobStatus::Idle);
        assert_eq!(s.stages.len(), StageId::COUNT);
        assert!(s.stages.iter().all(|st| st.status == StageStatus::Pending));
        assert_eq!(s.files.len(), 2);
        assert!(!s.can_start());
    }

    #[test]
    fn test_stage_progress_is_clamped() {
        let mut s = state(&[]);
        s.set_stage_progress(StageId::Train, 250);
        assert_eq!(s.stage(StageId::Train).progress, 100);
    }

    #[test]
    fn test_complete_stage_updates_overall_progress() {
        let mut s = state(&[]);
        s.transition(JobStatus::Starting).unwrap();
        for id in &StageId::ALL[..3] {
            s.begin_stage(*id).unwrap();
            s.complete_stage(*id);
        }
        assert!((s.progress - 3.0 / 9.0 * 100.0).abs() < 1e-9);
        s.complete();
        assert!((s.progress - 100.0).abs() < f64::EPSILON);
        assert!(s.can_start());
    }

    #[test]
    fn test_fail_stage_skips_later_stages() {
        let mut s = state(&["a"]);
        s.transition(JobStatus::Starting).unwrap();
        s.begin_stage(StageId::DetectDevice).unwrap();
        s.complete_stage(StageId::DetectDevice);
        s.begin_stage(StageId::ImportRuntime).unwrap();
        s.fail_stage(StageId::ImportRuntime, ErrorCode::ImportFailed);

        assert_eq!(s.status, JobStatus::Failed);
        assert_eq!(s.error_code, Some(ErrorCode::ImportFailed));
        assert_eq!(s.stage(StageId::DetectDevice).status, StageStatus::Completed);
        assert_eq!(s.stage(StageId::ImportRuntime).status, StageStatus::Failed);
        assert!(s.stages[2..].iter().all(|st| st.status == StageStatus::Skipped));
        // Failure leaves file statuses alone
        assert_eq!(s.files[0].status, StageStatus::Pending);
    }

    #[test]
    fn test_cancel_skips_open_stages_and_files() {
        let mut s = state(&["a", "b"]);
        s.transition(JobStatus::Starting).unwrap();
        s.begin_stage(StageId::DetectDevice).unwrap();
        s.complete_stage(StageId::DetectDevice);
        s.begin_stage(StageId::ImportRuntime).unwrap();
        s.file_started(0);
        s.file_completed(0, 3, 0);
        s.cancel();

        assert_eq!(s.status, JobStatus::Cancelled);
        assert_eq!(s.error_code, Some(ErrorCode::Cancelled));
        assert_eq!(s.stage(StageId::DetectDevice).status, StageStatus::Completed);
        assert!(s.stages[1..].iter().all(|st| st.status == StageStatus::Skipped));
        assert_eq!(s.files[0].status, StageStatus::Completed);
        assert_eq!(s.files[1].status, StageStatus::Skipped);
    }

    #[test]
    fn test_begin_stage_rejected_after_terminal() {
        let mut s = state(&[]);
        s.transition(JobStatus::Starting).unwrap();
        s.cancel();
        assert_eq!(s.begin_stage(StageId::Train), Err(JobStatus::Cancelled));
    }

    #[test]
    fn test_file_row_counts() {
        let mut s = state(&["a", "b"]);
        s.file_started(0);
        s.file_row_skipped(0);
        s.file_completed(0, 4, 1);
        s.file_failed(1);

        assert_eq!(s.files_done(), 2);
        assert_eq!(s.rows_loaded_total(), 4);
        assert_eq!(s.stage(StageId::Tokenize).error_count, 2);
        assert_eq!(s.files[1].status, StageStatus::Failed);
    }

    #[test]
    fn test_failed_file_counts_as_tokenize_error() {
        let mut s = state(&["a", "b", "c"]);
        s.file_failed(0);
        s.file_failed(2);

        assert_eq!(s.stage(StageId::Tokenize).error_count, 2);
        assert_eq!(s.files[1].status, StageStatus::Pending);
        assert_eq!(s.files_done(), 2);
    }
}
