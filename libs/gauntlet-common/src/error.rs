use std::time::Duration;
use thiserror::Error;

use crate::types::{ErrorKind, JobError};

/// Pipeline failure taxonomy
///
/// Every stage of the worker pipeline reduces its own error into one of these
/// variants. The worker records the result on the job as a [`JobError`]; none of
/// them are allowed to escape the worker loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{message}")]
    Staging {
        message: String,
        detail: Option<String>,
    },

    #[error("evaluation timed out after {}s", .0.as_secs())]
    ExecutionTimeout(Duration),

    #[error("evaluation failed: {message}")]
    Evaluation {
        message: String,
        detail: Option<String>,
    },

    #[error("failed to publish result: {message}")]
    Publish {
        message: String,
        detail: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Staging { .. } => ErrorKind::StagingError,
            PipelineError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            PipelineError::Evaluation { .. } => ErrorKind::EvaluationError,
            PipelineError::Publish { .. } => ErrorKind::PublishError,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        let detail = match self {
            PipelineError::Staging { detail, .. }
            | PipelineError::Evaluation { detail, .. }
            | PipelineError::Publish { detail, .. } => detail.clone(),
            _ => None,
        };

        JobError {
            kind: self.kind(),
            message: self.to_string(),
            detail,
        }
    }
}

/// Render an error's `source()` chain as a single detail line.
pub fn source_chain(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        parts.push(cause.to_string());
        current = cause.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}
