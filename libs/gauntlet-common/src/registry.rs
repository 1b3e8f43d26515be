use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{EvaluationRequest, Job, JobError, JobResult, JobStatus};

/// State change requested by the execution queue.
#[derive(Debug, Clone)]
pub enum Transition {
    Start,
    Complete(JobResult),
    Fail(JobError),
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete(_) => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    /// The record was deleted while the job was queued or running.
    #[error("job {0} is no longer registered")]
    Missing(Uuid),

    #[error("job {id} cannot move from {from} to {to}")]
    Invalid {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Job Registry
///
/// The single source of truth for job state. All records live behind one lock;
/// every read hands out a clone, so callers never observe a half-applied
/// transition. The registry itself does not limit how many jobs are
/// `processing` - the execution queue does.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `queued` state.
    pub async fn create(&self, request: EvaluationRequest) -> Job {
        let mut jobs = self.jobs.write().await;
        let mut job = Job::new(request);
        while jobs.contains_key(&job.id) {
            job.id = Uuid::new_v4();
        }
        jobs.insert(job.id, job.clone());
        job
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Snapshot of every record, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Remove a record. Returns whether anything was removed.
    pub async fn delete(&self, id: &Uuid) -> bool {
        self.jobs.write().await.remove(id).is_some()
    }

    pub async fn transition(&self, id: &Uuid, transition: Transition) -> Result<Job, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(TransitionError::Missing(*id))?;

        let to = transition.target();
        if !job.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                id: *id,
                from: job.status,
                to,
            });
        }

        match transition {
            Transition::Start => {
                job.started_at = Some(not_before(job.created_at));
            }
            Transition::Complete(result) => {
                job.completed_at = Some(not_before(job.started_at.unwrap_or(job.created_at)));
                job.result = Some(result);
            }
            Transition::Fail(error) => {
                job.completed_at = Some(not_before(job.started_at.unwrap_or(job.created_at)));
                job.error = Some(error);
            }
        }
        job.status = to;

        Ok(job.clone())
    }

    /// Number of jobs that are queued or processing.
    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| !job.status.is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drop terminal jobs that finished more than `max_age` ago.
    pub async fn purge_terminal_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| match (job.status.is_terminal(), job.completed_at) {
            (true, Some(done)) => done > cutoff,
            _ => true,
        });
        before - jobs.len()
    }
}

/// Current time, clamped so timestamps never run backwards on clock adjustments.
fn not_before(earlier: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(earlier)
}
