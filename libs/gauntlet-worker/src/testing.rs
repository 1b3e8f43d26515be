//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use gauntlet_common::config::DatasetConfig;
use gauntlet_common::EvalMode;
use object_store::memory::InMemory;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dataset::DatasetCache;
use crate::engine::{EngineError, EvaluationEngine};
use crate::executor::Executor;
use crate::pipeline::Pipeline;
use crate::publisher::ResultPublisher;
use crate::stager::SubmissionStager;
use crate::store::RemoteStore;

pub const DATASET_KEY: &str = "private/dataset_test.tar.gz";

pub fn memory_store() -> RemoteStore {
    RemoteStore::new(Arc::new(InMemory::new()))
}

/// Build a gzip'd tarball in memory.
pub fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub async fn put(store: &RemoteStore, key: &str, data: Vec<u8>) {
    store.put_bytes(key, Bytes::from(data)).await.unwrap();
}

pub async fn seed_dataset(store: &RemoteStore) {
    put(
        store,
        DATASET_KEY,
        tar_gz(&[
            ("dataset_test/images/0001.png", "png-1"),
            ("dataset_test/images/0002.png", "png-2"),
            ("dataset_test/labels.csv", "id,label\n1,a\n2,b\n"),
        ]),
    )
    .await;
}

pub async fn seed_submission(store: &RemoteStore, key: &str) {
    put(
        store,
        key,
        tar_gz(&[("predict.py", "def predict(x):\n    return x\n")]),
    )
    .await;
}

pub fn dataset_config(cache_root: &Path) -> DatasetConfig {
    DatasetConfig {
        key: DATASET_KEY.to_string(),
        name: "dataset_test".to_string(),
        cache_root: cache_root.to_path_buf(),
        warm_on_startup: false,
    }
}

pub fn pipeline(
    store: &RemoteStore,
    cache_root: &Path,
    engine: Arc<dyn EvaluationEngine>,
    budget: Duration,
) -> Pipeline {
    Pipeline::new(
        Arc::new(DatasetCache::new(dataset_config(cache_root), store.clone())),
        SubmissionStager::new(store.clone(), Some("predict.py".to_string())),
        Executor::new(engine, budget),
        ResultPublisher::new(store.clone(), "results"),
    )
}

/// Engine that sleeps, then returns a fixed outcome, while tracking how many
/// evaluations overlap.
pub struct ScriptedEngine {
    delay: Duration,
    outcome: std::result::Result<serde_json::Value, String>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    seen: Mutex<Vec<(std::path::PathBuf, EvalMode)>>,
}

impl ScriptedEngine {
    pub fn succeeding(delay: Duration) -> Arc<Self> {
        Self::with_outcome(
            delay,
            Ok(serde_json::json!({
                "metrics": {"accuracy": 0.75, "f1": 0.7},
                "predictions": 2
            })),
        )
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::with_outcome(Duration::ZERO, Err(message.to_string()))
    }

    fn with_outcome(
        delay: Duration,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            delay,
            outcome,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(std::path::PathBuf, EvalMode)> {
        self.seen.lock().unwrap().clone()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EvaluationEngine for ScriptedEngine {
    async fn evaluate(
        &self,
        _dataset: &Path,
        submission: &Path,
        mode: EvalMode,
    ) -> std::result::Result<serde_json::Value, EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((submission.to_path_buf(), mode));

        tokio::time::sleep(self.delay).await;
        self.outcome.clone().map_err(EngineError::Failed)
    }
}
