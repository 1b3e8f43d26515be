/// Execution Queue - single-worker FIFO
///
/// **Core Responsibility:**
/// Accept job ids without blocking the caller and feed them, one at a time, to
/// the evaluation pipeline.
///
/// **Guarantees:**
/// - At most one job is between `Start` and its terminal transition at any time.
/// - Every job that was started ends `completed` or `failed`, including when the
///   pipeline panics.
/// - A job deleted while queued is skipped; one deleted while processing runs to
///   completion and its outcome is dropped.

use gauntlet_common::config::MAX_QUEUE_CAPACITY;
use gauntlet_common::registry::TransitionError;
use gauntlet_common::{
    CompletionEvent, EvaluationRequest, Job, JobRegistry, JobStatus, PipelineError, Transition,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::Pipeline;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("execution queue is full ({0} jobs waiting)")]
    QueueFull(usize),

    #[error("execution worker is not running")]
    Closed,
}

/// Intake side of the queue. Cheap to clone; every clone feeds the same worker.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    registry: Arc<JobRegistry>,
    sender: mpsc::Sender<Uuid>,
    events: broadcast::Sender<CompletionEvent>,
    capacity: usize,
}

impl ExecutionQueue {
    /// Create the intake without a consumer. Pair the receiver with a [`Worker`].
    pub fn new(registry: Arc<JobRegistry>, capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        let (sender, receiver) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        (
            Self {
                registry,
                sender,
                events,
                capacity,
            },
            receiver,
        )
    }

    /// Create the intake and spawn its worker.
    pub fn start(
        registry: Arc<JobRegistry>,
        pipeline: Arc<Pipeline>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, receiver) = Self::new(registry.clone(), capacity);
        let worker = Worker {
            registry,
            pipeline,
            events: queue.events.clone(),
        };
        let handle = tokio::spawn(worker.run(receiver));
        (queue, handle)
    }

    /// Register a job and hand it to the worker. Never waits for execution.
    pub async fn submit(&self, request: EvaluationRequest) -> Result<Job, SubmitError> {
        let job = self.registry.create(request).await;

        match self.sender.try_send(job.id) {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    submission = %job.submission_reference,
                    mode = %job.mode(),
                    "Job queued"
                );
                Ok(job)
            }
            Err(e) => {
                self.registry.delete(&job.id).await;
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(capacity = self.capacity, "Rejected job: queue full");
                        Err(SubmitError::QueueFull(self.capacity))
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        error!("Rejected job: worker stopped");
                        Err(SubmitError::Closed)
                    }
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }
}

/// The single consumer of the intake channel.
pub struct Worker {
    registry: Arc<JobRegistry>,
    pipeline: Arc<Pipeline>,
    events: broadcast::Sender<CompletionEvent>,
}

impl Worker {
    pub fn new(
        registry: Arc<JobRegistry>,
        pipeline: Arc<Pipeline>,
        events: broadcast::Sender<CompletionEvent>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            events,
        }
    }

    /// Process ids until every sender is dropped.
    pub async fn run(self, mut receiver: mpsc::Receiver<Uuid>) {
        info!("Execution worker started");
        while let Some(id) = receiver.recv().await {
            self.process(id).await;
        }
        info!("Execution worker stopped");
    }

    async fn process(&self, id: Uuid) {
        let job = match self.registry.transition(&id, Transition::Start).await {
            Ok(job) => job,
            Err(TransitionError::Missing(_)) => {
                info!(job_id = %id, "Job deleted while queued; skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Cannot start job");
                return;
            }
        };
        info!(job_id = %id, display_name = %job.display_name, "→ Processing job");

        // A panic anywhere in the pipeline surfaces here as a JoinError.
        let pipeline = self.pipeline.clone();
        let running = job.clone();
        let outcome = match tokio::spawn(async move { pipeline.run(&running).await }).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(PipelineError::Internal(format!(
                "pipeline task failed: {join_error}"
            ))),
        };

        let event = match &outcome {
            Ok(result) => CompletionEvent {
                job_id: id,
                status: JobStatus::Completed,
                error_kind: None,
                eval_time_secs: Some(result.eval_time_secs),
            },
            Err(e) => CompletionEvent {
                job_id: id,
                status: JobStatus::Failed,
                error_kind: Some(e.kind()),
                eval_time_secs: None,
            },
        };

        let transition = match outcome {
            Ok(result) => Transition::Complete(result),
            Err(e) => {
                warn!(job_id = %id, kind = %e.kind(), error = %e, "✗ Job failed");
                Transition::Fail(e.to_job_error())
            }
        };

        match self.registry.transition(&id, transition).await {
            Ok(job) => info!(job_id = %id, status = %job.status, "Job finished"),
            Err(TransitionError::Missing(_)) => {
                info!(job_id = %id, "Job deleted while processing; outcome dropped")
            }
            Err(e) => error!(job_id = %id, error = %e, "Cannot finish job"),
        }

        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, pipeline, seed_dataset, seed_submission, ScriptedEngine};
    use crate::store::RemoteStore;
    use gauntlet_common::ErrorKind;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Harness {
        queue: ExecutionQueue,
        registry: Arc<JobRegistry>,
        store: RemoteStore,
        pipeline: Arc<Pipeline>,
        _cache: TempDir,
    }

    async fn harness(engine: Arc<ScriptedEngine>, budget: Duration) -> Harness {
        let store = memory_store();
        seed_dataset(&store).await;
        let cache = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(&store, cache.path(), engine, budget));
        let registry = Arc::new(JobRegistry::new());
        let (queue, _handle) = ExecutionQueue::start(registry.clone(), pipeline.clone(), 16);
        Harness {
            queue,
            registry,
            store,
            pipeline,
            _cache: cache,
        }
    }

    fn request(key: &str) -> EvaluationRequest {
        EvaluationRequest {
            submission_reference: key.to_string(),
            display_name: "Alan Turing".to_string(),
            quick_mode: false,
            submission_id: None,
        }
    }

    async fn wait_terminal(registry: &JobRegistry, id: Uuid) -> Job {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = registry.get(&id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            assert!(Instant::now() < deadline, "job {id} never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_reuses_dataset() {
        let h = harness(
            ScriptedEngine::succeeding(Duration::from_millis(50)),
            Duration::from_secs(5),
        )
        .await;
        seed_submission(&h.store, "submissions/a.tar.gz").await;
        seed_submission(&h.store, "submissions/b.tar.gz").await;

        let a = h.queue.submit(request("submissions/a.tar.gz")).await.unwrap();
        assert_eq!(a.status, JobStatus::Queued);

        let a = wait_terminal(&h.registry, a.id).await;
        assert_eq!(a.status, JobStatus::Completed);
        let result = a.result.unwrap();
        assert_eq!(result.metrics["f1"], serde_json::json!(0.7));
        assert!(h.store.exists(&result.result_key).await.unwrap());
        assert!(a.started_at.unwrap() >= a.created_at);
        assert!(a.completed_at.unwrap() >= a.started_at.unwrap());

        let b = h.queue.submit(request("submissions/b.tar.gz")).await.unwrap();
        let b = wait_terminal(&h.registry, b.id).await;
        assert_eq!(b.status, JobStatus::Completed);
        assert_eq!(h.pipeline.dataset().downloads(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_job_processing() {
        let engine = ScriptedEngine::succeeding(Duration::from_millis(40));
        let h = harness(engine.clone(), Duration::from_secs(5)).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let key = format!("submissions/{i}.tar.gz");
            seed_submission(&h.store, &key).await;
            ids.push(h.queue.submit(request(&key)).await.unwrap().id);
        }

        loop {
            let jobs = h.registry.list().await;
            let processing = jobs
                .iter()
                .filter(|j| j.status == JobStatus::Processing)
                .count();
            assert!(processing <= 1, "{processing} jobs processing at once");
            if jobs.iter().all(|j| j.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(engine.calls(), 5);
        assert_eq!(engine.max_active(), 1);

        // FIFO: start times follow submission order.
        let mut starts = Vec::new();
        for id in &ids {
            starts.push(h.registry.get(id).await.unwrap().started_at.unwrap());
        }
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_see_monotonic_single_worker() {
        const SUBMITTERS: usize = 8;
        let engine = ScriptedEngine::succeeding(Duration::from_millis(25));
        let h = harness(engine.clone(), Duration::from_secs(5)).await;
        for i in 0..SUBMITTERS {
            seed_submission(&h.store, &format!("submissions/{i}.tar.gz")).await;
        }

        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let registry = h.registry.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut highest: HashMap<Uuid, u8> = HashMap::new();
                let mut most_processing = 0;
                while !done.load(Ordering::SeqCst) {
                    let jobs = registry.list().await;
                    let processing = jobs
                        .iter()
                        .filter(|j| j.status == JobStatus::Processing)
                        .count();
                    most_processing = most_processing.max(processing);
                    for job in &jobs {
                        let rank = job.status.rank();
                        let seen = highest.entry(job.id).or_insert(rank);
                        assert!(rank >= *seen, "job {} went back to {}", job.id, job.status);
                        *seen = rank;
                    }
                    tokio::task::yield_now().await;
                }
                (highest, most_processing)
            })
        };

        let submitters: Vec<_> = (0..SUBMITTERS)
            .map(|i| {
                let queue = h.queue.clone();
                tokio::spawn(async move {
                    queue
                        .submit(request(&format!("submissions/{i}.tar.gz")))
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect();
        let mut ids = Vec::new();
        for submitter in submitters {
            ids.push(submitter.await.unwrap());
        }

        for id in &ids {
            assert_eq!(wait_terminal(&h.registry, *id).await.status, JobStatus::Completed);
        }
        done.store(true, Ordering::SeqCst);
        let (highest, most_processing) = watcher.await.unwrap();

        assert!(most_processing <= 1, "{most_processing} jobs processing at once");
        assert_eq!(engine.max_active(), 1);
        assert_eq!(engine.calls(), SUBMITTERS);
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), SUBMITTERS);
        assert!(highest.values().all(|rank| *rank <= JobStatus::Completed.rank()));
    }

    #[tokio::test]
    async fn test_missing_submission_fails_and_worker_continues() {
        let h = harness(ScriptedEngine::succeeding(Duration::ZERO), Duration::from_secs(5)).await;
        seed_submission(&h.store, "submissions/ok.tar.gz").await;

        let bad = h.queue.submit(request("submissions/ghost.tar.gz")).await.unwrap();
        let good = h.queue.submit(request("submissions/ok.tar.gz")).await.unwrap();

        let bad = wait_terminal(&h.registry, bad.id).await;
        assert_eq!(bad.status, JobStatus::Failed);
        let error = bad.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StagingError);
        assert_eq!(error.message, "submission not found: submissions/ghost.tar.gz");
        assert!(bad.result.is_none());

        let good = wait_terminal(&h.registry, good.id).await;
        assert_eq!(good.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_timeout_fails_within_margin() {
        let h = harness(
            ScriptedEngine::succeeding(Duration::from_secs(60)),
            Duration::from_millis(200),
        )
        .await;
        seed_submission(&h.store, "submissions/slow.tar.gz").await;

        let started = Instant::now();
        let job = h.queue.submit(request("submissions/slow.tar.gz")).await.unwrap();
        let job = wait_terminal(&h.registry, job.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, ErrorKind::ExecutionTimeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_delete_while_processing_drops_outcome() {
        let h = harness(
            ScriptedEngine::succeeding(Duration::from_millis(300)),
            Duration::from_secs(5),
        )
        .await;
        seed_submission(&h.store, "submissions/a.tar.gz").await;
        seed_submission(&h.store, "submissions/b.tar.gz").await;
        let mut events = h.queue.subscribe();

        let a = h.queue.submit(request("submissions/a.tar.gz")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.registry.get(&a.id).await.map(|j| j.status) != Some(JobStatus::Processing) {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.registry.delete(&a.id).await);

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, a.id);
        assert!(h.registry.get(&a.id).await.is_none());

        let b = h.queue.submit(request("submissions/b.tar.gz")).await.unwrap();
        assert_eq!(wait_terminal(&h.registry, b.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_completion_events_are_broadcast() {
        let h = harness(ScriptedEngine::succeeding(Duration::ZERO), Duration::from_secs(5)).await;
        seed_submission(&h.store, "submissions/ok.tar.gz").await;
        let mut events = h.queue.subscribe();

        let ok = h.queue.submit(request("submissions/ok.tar.gz")).await.unwrap();
        let bad = h.queue.submit(request("submissions/none.tar.gz")).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.job_id, ok.id);
        assert_eq!(first.status, JobStatus::Completed);
        assert!(first.eval_time_secs.is_some());

        let second = events.recv().await.unwrap();
        assert_eq!(second.job_id, bad.id);
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.error_kind, Some(ErrorKind::StagingError));
    }

    #[tokio::test]
    async fn test_full_intake_rejects_and_forgets_job() {
        let registry = Arc::new(JobRegistry::new());
        let (queue, _receiver) = ExecutionQueue::new(registry.clone(), 1);

        let first = queue.submit(request("submissions/a.tar.gz")).await.unwrap();

        let err = queue.submit(request("submissions/b.tar.gz")).await.unwrap_err();
        assert_eq!(err, SubmitError::QueueFull(1));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&first.id).await.is_some());
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_submissions() {
        let registry = Arc::new(JobRegistry::new());
        let (queue, receiver) = ExecutionQueue::new(registry.clone(), 4);
        drop(receiver);

        let err = queue.submit(request("submissions/a.tar.gz")).await.unwrap_err();
        assert_eq!(err, SubmitError::Closed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_job_deleted_while_queued_is_skipped() {
        let engine = ScriptedEngine::succeeding(Duration::ZERO);
        let store = memory_store();
        seed_dataset(&store).await;
        seed_submission(&store, "submissions/a.tar.gz").await;
        let cache = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(
            &store,
            cache.path(),
            engine.clone(),
            Duration::from_secs(5),
        ));
        let registry = Arc::new(JobRegistry::new());

        let (queue, receiver) = ExecutionQueue::new(registry.clone(), 4);
        let job = queue.submit(request("submissions/a.tar.gz")).await.unwrap();
        registry.delete(&job.id).await;

        let worker = Worker::new(registry.clone(), pipeline, queue.events.clone());
        drop(queue);
        worker.run(receiver).await;

        assert_eq!(engine.calls(), 0);
        assert!(registry.is_empty().await);
    }
}
