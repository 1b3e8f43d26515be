pub mod config;
pub mod error;
pub mod keys;
pub mod registry;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::PipelineError;
pub use registry::{JobRegistry, Transition, TransitionError};
pub use types::{
    CompletionEvent, ErrorKind, EvalMode, EvaluationRequest, Job, JobError, JobResult, JobStatus,
};
