use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Evaluation mode requested by the caller.
/// `Quick` runs the routine on a reduced sample and is used for validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    #[default]
    Full,
    Quick,
}

impl EvalMode {
    pub fn from_quick_flag(quick: bool) -> Self {
        if quick {
            EvalMode::Quick
        } else {
            EvalMode::Full
        }
    }

    pub fn is_quick(&self) -> bool {
        matches!(self, EvalMode::Quick)
    }
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalMode::Full => write!(f, "full"),
            EvalMode::Quick => write!(f, "quick"),
        }
    }
}

/// Job State Machine
///
/// `queued → processing → {completed | failed}`. Terminal states never move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Position in the lifecycle, used to check that observed statuses never regress.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Job Input
///
/// The field aliases accept the payload shape of the older scheduler integration
/// (`submission_s3_key`, `full_name`, `quick_test`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    #[serde(alias = "submission_s3_key")]
    pub submission_reference: String,
    #[serde(alias = "full_name")]
    pub display_name: String,
    #[serde(default, alias = "quick_test")]
    pub quick_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<i64>,
}

impl EvaluationRequest {
    pub fn mode(&self) -> EvalMode {
        EvalMode::from_quick_flag(self.quick_mode)
    }
}

/// Successful outcome attached to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<i64>,
    /// Opaque metrics record produced by the evaluation routine.
    pub metrics: serde_json::Value,
    /// Object-store key of the published report.
    pub result_key: String,
    pub eval_time_secs: f64,
}

/// Failure classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StagingError,
    ExecutionTimeout,
    EvaluationError,
    PublishError,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::StagingError => "staging_error",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::EvaluationError => "evaluation_error",
            ErrorKind::PublishError => "publish_error",
            ErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Failure attached to a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Job lifecycle record
///
/// Backs `GET /status/{id}` and `GET /jobs`. `result` and `error` are only
/// serialized once the job is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: Uuid,
    pub status: JobStatus,
    pub submission_reference: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<i64>,
    pub quick_mode: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(request: EvaluationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            submission_reference: request.submission_reference,
            display_name: request.display_name,
            submission_id: request.submission_id,
            quick_mode: request.quick_mode,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn mode(&self) -> EvalMode {
        EvalMode::from_quick_flag(self.quick_mode)
    }
}

/// Emitted by the execution queue whenever a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub error_kind: Option<ErrorKind>,
    pub eval_time_secs: Option<f64>,
}
