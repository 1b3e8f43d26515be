use bytes::Bytes;
use gauntlet_common::error::source_chain;
use gauntlet_common::keys::result_key;
use gauntlet_common::{Job, PipelineError};
use thiserror::Error;
use tracing::info;

use crate::engine::EvaluationOutput;
use crate::store::{RemoteStore, StoreError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("report could not be serialized")]
    Serialize(#[source] serde_json::Error),

    #[error("upload to {key} failed")]
    Upload {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl From<PublishError> for PipelineError {
    fn from(err: PublishError) -> Self {
        PipelineError::Publish {
            message: err.to_string(),
            detail: source_chain(&err),
        }
    }
}

/// Uploads evaluation reports under a key derived from the job.
#[derive(Debug, Clone)]
pub struct ResultPublisher {
    store: RemoteStore,
    prefix: String,
}

impl ResultPublisher {
    pub fn new(store: RemoteStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Key for a job's report. Uses the processing start time, falling back to
    /// creation time for jobs that never started.
    pub fn result_key(&self, job: &Job) -> String {
        let timestamp = job.started_at.unwrap_or(job.created_at);
        result_key(&self.prefix, &job.display_name, timestamp)
    }

    pub async fn publish(&self, job: &Job, output: &EvaluationOutput) -> Result<String, PublishError> {
        let key = self.result_key(job);
        let body = serde_json::to_vec_pretty(&output.report).map_err(PublishError::Serialize)?;

        self.store
            .put_bytes(&key, Bytes::from(body))
            .await
            .map_err(|source| PublishError::Upload {
                key: key.clone(),
                source,
            })?;

        info!(job_id = %job.id, key = %key, "Published evaluation report");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_store;
    use chrono::{TimeZone, Utc};
    use gauntlet_common::EvaluationRequest;
    use serde_json::json;
    use std::time::Duration;

    fn job(name: &str) -> Job {
        let mut job = Job::new(EvaluationRequest {
            submission_reference: "submissions/a.tar.gz".to_string(),
            display_name: name.to_string(),
            quick_mode: false,
            submission_id: Some(3),
        });
        job.started_at = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        job
    }

    #[tokio::test]
    async fn test_publish_uploads_pretty_report() {
        let store = memory_store();
        let publisher = ResultPublisher::new(store.clone(), "results");
        let output = EvaluationOutput {
            report: json!({"metrics": {"accuracy": 0.5}}),
            elapsed: Duration::from_secs(2),
        };

        let key = publisher.publish(&job("Ada Lovelace"), &output).await.unwrap();
        assert_eq!(key, "results/Ada_Lovelace/1700000000/results.json");

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("r.json");
        store.download(&key, &local).await.unwrap();
        let text = std::fs::read_to_string(local).unwrap();
        assert!(text.contains('\n'));
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), output.report);
    }

    #[test]
    fn test_key_falls_back_to_creation_time() {
        let publisher = ResultPublisher::new(memory_store(), "out");
        let mut job = job("team/x");
        job.started_at = None;

        let key = publisher.result_key(&job);
        assert_eq!(
            key,
            format!("out/team_x/{}/results.json", job.created_at.timestamp())
        );
    }

    #[test]
    fn test_publish_error_maps_to_publish_kind() {
        let err = PublishError::Upload {
            key: "k".to_string(),
            source: StoreError::Config("unreachable".to_string()),
        };
        let failure: PipelineError = err.into();
        assert_eq!(failure.kind(), gauntlet_common::ErrorKind::PublishError);
        assert_eq!(
            failure.to_job_error().detail.as_deref(),
            Some("failed to configure object store: unreachable")
        );
    }
}
