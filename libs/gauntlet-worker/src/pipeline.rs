//! One job, start to finish: dataset, staging, evaluation, publishing.

use gauntlet_common::{Config, Job, JobResult, PipelineError};
use std::sync::Arc;
use tracing::{info, Instrument};

use crate::dataset::DatasetCache;
use crate::engine::CommandEngine;
use crate::executor::Executor;
use crate::publisher::ResultPublisher;
use crate::stager::SubmissionStager;
use crate::store::{RemoteStore, StoreError};

#[derive(Debug)]
pub struct Pipeline {
    dataset: Arc<DatasetCache>,
    stager: SubmissionStager,
    executor: Executor,
    publisher: ResultPublisher,
}

impl Pipeline {
    pub fn new(
        dataset: Arc<DatasetCache>,
        stager: SubmissionStager,
        executor: Executor,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            dataset,
            stager,
            executor,
            publisher,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = RemoteStore::from_config(&config.store)?;
        let engine = CommandEngine::from_config(&config.evaluator);

        Ok(Self::new(
            Arc::new(DatasetCache::new(config.dataset.clone(), store.clone())),
            SubmissionStager::new(store.clone(), config.evaluator.required_entrypoint.clone()),
            Executor::new(Arc::new(engine), config.evaluator.timeout),
            ResultPublisher::new(store, config.results_prefix.clone()),
        ))
    }

    pub fn dataset(&self) -> &Arc<DatasetCache> {
        &self.dataset
    }

    pub async fn run(&self, job: &Job) -> Result<JobResult, PipelineError> {
        let span = tracing::info_span!(
            "pipeline",
            job_id = %job.id,
            submission = %job.submission_reference,
            mode = %job.mode()
        );
        self.run_stages(job).instrument(span).await
    }

    async fn run_stages(&self, job: &Job) -> Result<JobResult, PipelineError> {
        let dataset = self.dataset.ensure_ready().await?;
        let staged = self.stager.stage(&job.submission_reference).await?;

        let output = self
            .executor
            .run(&dataset, staged.path(), job.mode())
            .await?;
        let result_key = self.publisher.publish(job, &output).await?;

        // Workspace is only needed until the report is out.
        drop(staged);

        let eval_time_secs = output.elapsed.as_secs_f64();
        info!(eval_time_secs, result_key = %result_key, "✓ Evaluation complete");
        Ok(JobResult {
            submission_id: job.submission_id,
            metrics: output.metrics(),
            result_key,
            eval_time_secs,
        })
    }
}
