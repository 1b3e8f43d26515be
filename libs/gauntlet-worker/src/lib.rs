//! Evaluation pipeline: object store access, dataset cache, submission
//! staging, time-bounded execution, result publishing, and the single-worker
//! execution queue that drives them.

pub mod archive;
pub mod dataset;
pub mod engine;
pub mod executor;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod stager;
pub mod store;

#[cfg(test)]
mod testing;

pub use dataset::{DatasetCache, DatasetError, DatasetState, IntegrityMarker};
pub use engine::{CommandEngine, EngineError, EvaluationEngine, EvaluationOutput};
pub use executor::{ExecutionError, Executor};
pub use pipeline::Pipeline;
pub use publisher::{PublishError, ResultPublisher};
pub use queue::{ExecutionQueue, SubmitError, Worker};
pub use stager::{StagedSubmission, StagingError, SubmissionStager};
pub use store::{RemoteStore, StoreError};
