//! Job registry: the most recent job of every project.
//!
//! A project has at most one non-terminal job. Admission and registration
//! happen under a single lock acquisition; the lock is never held across an
//! await.

use crate::error::StartError;
use crate::job::{JobSpec, JobWriter, TrainingJob};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Registry of training jobs keyed by project identifier.
#[derive(Default)]
pub struct JobRegistry {
    /// Map of project identifier to its most recent job.
    jobs: Mutex<HashMap<String, Arc<TrainingJob>>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_count", &self.jobs.try_lock().map(|j| j.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TrainingJob>>> {
        // A poisoned map is still structurally valid
        self.jobs.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Admits a new job for `spec.project`.
    ///
    /// # Arguments
    /// * `spec` - Inputs of the new job
    ///
    /// # Returns
    /// Returns the job handle and its writer, or `StartError::AlreadyRunning`
    /// if the registered job has not reached a terminal status. A terminal job
    /// is replaced.
    pub fn admit(&self, spec: JobSpec) -> Result<(Arc<TrainingJob>, JobWriter), StartError> {
        let mut jobs = self.lock();
        let project = spec.project.clone();

        if let Some(existing) = jobs.get(&project) {
            if !existing.is_terminal() {
                debug!(project = %project, job_id = %existing.id(), "Rejecting start: job still active");
                return Err(StartError::AlreadyRunning(project));
            }
        }

        let (job, writer) = TrainingJob::new(spec);
        if let Some(previous) = jobs.insert(project.clone(), Arc::clone(&job)) {
            info!(project = %project, previous = %previous.id(), job_id = %job.id(), "Replacing finished job");
        } else {
            info!(project = %project, job_id = %job.id(), "Registered job");
        }
        Ok((job, writer))
    }

    /// Retrieves the most recent job of a project.
    pub fn get_job(&self, project: &str) -> Option<Arc<TrainingJob>> {
        self.lock().get(project).cloned()
    }

    /// Checks if a project has a job executing stages.
    ///
    /// # Returns
    /// Returns `true` iff a job is registered and its status is one of the
    /// active statuses (`starting` through `converting`).
    pub fn is_running(&self, project: &str) -> bool {
        self.get_job(project).is_some_and(|job| job.is_running())
    }

    /// Checks if a project has a non-terminal job, which blocks admission.
    pub fn is_busy(&self, project: &str) -> bool {
        self.get_job(project).is_some_and(|job| !job.is_terminal())
    }

    /// Requests cancellation of a project's job.
    ///
    /// A just-admitted `idle` job counts as cancellable: it already blocks
    /// admission, and its worker stops before the first stage.
    ///
    /// # Returns
    /// Returns `true` if a non-terminal job was found and its token tripped,
    /// `false` otherwise.
    pub fn cancel(&self, project: &str) -> bool {
        let Some(job) = self.get_job(project) else {
            return false;
        };
        let cancelled = job.cancel();
        if cancelled {
            info!(project = %project, job_id = %job.id(), "Cancellation requested");
        }
        cancelled
    }

    /// Returns the number of registered projects.
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forge_training::{ConfigOverrides, JobState, JobStatus, ProjectLayout};

    fn spec(project: &str) -> JobSpec {
        JobSpec {
            project: project.to_string(),
            layout: ProjectLayout::new(std::env::temp_dir().join(project)),
            model_id: "tiny".to_string(),
            filenames: vec!["a.jsonl".to_string()],
            format_variant: "q8_0".to_string(),
            target_name: None,
            overrides: ConfigOverrides::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_idle_job_blocks_admission_but_is_not_running() {
        let registry = JobRegistry::new();
        let (job, _writer) = registry.admit(spec("p")).unwrap();

        assert_eq!(job.status(), JobStatus::Idle);
        assert!(!registry.is_running("p"));
        assert_eq!(registry.admit(spec("p")).unwrap_err(), StartError::AlreadyRunning("p".to_string()));
        // Other projects are independent
        assert!(registry.admit(spec("q")).is_ok());
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_terminal_job_is_replaced() {
        let registry = JobRegistry::new();
        let (first, writer) = registry.admit(spec("p")).unwrap();
        writer.transition(JobStatus::Starting).unwrap();
        assert!(registry.is_running("p"));
        writer.update(JobState::complete);
        assert!(!registry.is_running("p"));

        let (second, _writer) = registry.admit(spec("p")).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.get_job("p").unwrap().id(), second.id());
    }

    #[test]
    fn test_cancel_only_non_terminal_jobs() {
        let registry = JobRegistry::new();
        assert!(!registry.cancel("p"));

        let (job, writer) = registry.admit(spec("p")).unwrap();
        assert!(registry.is_busy("p"));
        assert!(!registry.is_running("p"));
        // Idle jobs are cancellable
        assert!(registry.cancel("p"));
        assert!(job.is_cancelled());

        writer.update(JobState::cancel);
        assert!(!registry.cancel("p"));
        assert!(!registry.is_busy("p"));
    }
}
