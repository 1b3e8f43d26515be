//! Time-bounded evaluation.
//!
//! The engine runs in its own task so that a panic inside it surfaces as a
//! `JoinError` instead of taking the worker down, and so that an overrun can be
//! aborted. Aborting drops the engine future, which kills the process group it
//! spawned. Preparation runs first and is neither timed nor bounded by the
//! evaluation budget.

use gauntlet_common::{EvalMode, PipelineError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineError, EvaluationEngine, EvaluationOutput};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("evaluation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("evaluation failed: {message}")]
    Evaluation {
        message: String,
        detail: Option<String>,
    },
}

impl From<ExecutionError> for PipelineError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Timeout(budget) => PipelineError::ExecutionTimeout(budget),
            ExecutionError::Evaluation { message, detail } => {
                PipelineError::Evaluation { message, detail }
            }
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn EvaluationEngine>,
    budget: Duration,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(engine: Arc<dyn EvaluationEngine>, budget: Duration) -> Self {
        Self { engine, budget }
    }

    pub async fn run(
        &self,
        dataset: &Path,
        submission: &Path,
        mode: EvalMode,
    ) -> Result<EvaluationOutput, ExecutionError> {
        let dataset: PathBuf = dataset.to_path_buf();
        let submission: PathBuf = submission.to_path_buf();

        let engine = self.engine.clone();
        let staged = submission.clone();
        settle(tokio::spawn(async move { engine.prepare(&staged).await }).await)?;

        let engine = self.engine.clone();
        info!(
            submission = %submission.display(),
            mode = %mode,
            budget_secs = self.budget.as_secs(),
            "Starting evaluation"
        );
        let started = Instant::now();
        let mut task =
            tokio::spawn(async move { engine.evaluate(&dataset, &submission, mode).await });

        let joined = match tokio::time::timeout(self.budget, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                let _ = task.await;
                warn!(budget_secs = self.budget.as_secs(), "Evaluation exceeded its budget");
                return Err(ExecutionError::Timeout(self.budget));
            }
        };

        let elapsed = started.elapsed();
        let report = settle(joined)?;
        info!(elapsed_ms = elapsed.as_millis() as u64, "Evaluation finished");
        Ok(EvaluationOutput { report, elapsed })
    }
}

/// Classify the outcome of an engine task.
fn settle<T>(
    joined: Result<Result<T, EngineError>, tokio::task::JoinError>,
) -> Result<T, ExecutionError> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionError::Evaluation {
            detail: e.detail(),
            message: e.to_string(),
        }),
        Err(join_error) => {
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic())
            } else {
                "evaluation task was cancelled".to_string()
            };
            Err(ExecutionError::Evaluation {
                message: "evaluation routine crashed".to_string(),
                detail: Some(message),
            })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
