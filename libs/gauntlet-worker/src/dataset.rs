/// Dataset Cache Manager
///
/// **Core Responsibility:**
/// Make the shared reference dataset available on local storage exactly once
/// per host, however many jobs (or health probes) ask for it.
///
/// **Guarantees:**
/// - One fetch at a time: callers arriving mid-download wait on the fetch lock
///   and then observe the finished cache instead of starting a second download.
/// - `ready` is only reported after the extracted tree has been moved into place
///   and the integrity marker has been written.
/// - The marker and a file recount are re-validated on every call, so a cache
///   that was partially removed behind our back is fetched again.
/// - The download target, the extraction target and the canonical directory
///   are three different paths.

use chrono::{DateTime, Utc};
use gauntlet_common::config::DatasetConfig;
use gauntlet_common::error::source_chain;
use gauntlet_common::keys::marker_file_name;
use gauntlet_common::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{self, count_files, ArchiveError};
use crate::store::{RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetState {
    Absent,
    Downloading,
    Ready,
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetState::Absent => write!(f, "absent"),
            DatasetState::Downloading => write!(f, "downloading"),
            DatasetState::Ready => write!(f, "ready"),
        }
    }
}

/// Written next to the dataset directory once extraction has fully succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityMarker {
    pub source_key: String,
    pub file_count: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset archive {0} not found in object store")]
    MissingArchive(String),

    #[error("failed to download dataset archive {key}")]
    Download {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to extract dataset archive")]
    Extract(#[from] ArchiveError),

    #[error("dataset archive {0} contained no files")]
    Empty(String),

    #[error("dataset cache I/O error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<DatasetError> for PipelineError {
    fn from(err: DatasetError) -> Self {
        PipelineError::Staging {
            message: format!("reference dataset unavailable: {err}"),
            detail: source_chain(&err),
        }
    }
}

pub struct DatasetCache {
    config: DatasetConfig,
    store: RemoteStore,
    fetch_lock: Mutex<()>,
    state: watch::Sender<DatasetState>,
    downloads: AtomicU64,
}

impl fmt::Debug for DatasetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetCache")
            .field("key", &self.config.key)
            .field("dir", &self.config.dataset_dir())
            .field("state", &self.state())
            .finish()
    }
}

impl DatasetCache {
    pub fn new(config: DatasetConfig, store: RemoteStore) -> Self {
        let (state, _) = watch::channel(DatasetState::Absent);
        Self {
            config,
            store,
            fetch_lock: Mutex::new(()),
            state,
            downloads: AtomicU64::new(0),
        }
    }

    /// Current state, without waiting on an in-flight fetch.
    pub fn state(&self) -> DatasetState {
        *self.state.borrow()
    }

    /// Number of fetch sequences started by this instance.
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.config.dataset_dir()
    }

    pub fn marker_path(&self) -> PathBuf {
        self.config
            .cache_root
            .join(marker_file_name(&self.config.name))
    }

    /// Return the local dataset path, fetching it first if needed.
    pub async fn ensure_ready(&self) -> Result<PathBuf, DatasetError> {
        let _guard = self.fetch_lock.lock().await;
        let dir = self.dataset_dir();

        if let Some(marker) = self.verify().await {
            debug!(files = marker.file_count, path = %dir.display(), "Dataset cache hit");
            self.state.send_replace(DatasetState::Ready);
            return Ok(dir);
        }

        self.state.send_replace(DatasetState::Downloading);
        self.downloads.fetch_add(1, Ordering::SeqCst);
        info!(key = %self.config.key, "Fetching reference dataset");

        match self.fetch().await {
            Ok(marker) => {
                self.state.send_replace(DatasetState::Ready);
                info!(files = marker.file_count, path = %dir.display(), "✓ Reference dataset ready");
                Ok(dir)
            }
            Err(e) => {
                self.discard_marker().await;
                self.state.send_replace(DatasetState::Absent);
                error!(error = %e, "✗ Reference dataset fetch failed");
                Err(e)
            }
        }
    }

    /// Validate the on-disk cache without fetching anything.
    pub async fn inspect(&self) -> Option<IntegrityMarker> {
        self.verify().await
    }

    async fn verify(&self) -> Option<IntegrityMarker> {
        let raw = fs::read(self.marker_path()).await.ok()?;
        let marker: IntegrityMarker = match serde_json::from_slice(&raw) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable dataset marker");
                return None;
            }
        };

        if marker.source_key != self.config.key {
            info!(
                cached = %marker.source_key,
                configured = %self.config.key,
                "Cached dataset came from a different archive"
            );
            return None;
        }

        let dir = self.dataset_dir();
        let counted = tokio::task::spawn_blocking(move || count_files(&dir))
            .await
            .ok()?;
        match counted {
            Ok(count) if count == marker.file_count => Some(marker),
            Ok(count) => {
                warn!(
                    expected = marker.file_count,
                    found = count,
                    "Dataset cache does not match its marker"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Dataset directory is unreadable");
                None
            }
        }
    }

    async fn fetch(&self) -> Result<IntegrityMarker, DatasetError> {
        let root = &self.config.cache_root;
        fs::create_dir_all(root).await.map_err(|e| io_error(root, e))?;

        // Invalidate first so a crash mid-fetch never leaves a stale marker behind.
        self.discard_marker().await;

        let token = Uuid::new_v4().simple();
        let archive_path = root.join(format!(".download-{token}.tar.gz"));
        let staging = root.join(format!(".staging-{token}"));

        let outcome = self.fetch_into(&archive_path, &staging).await;

        let _ = fs::remove_file(&archive_path).await;
        let _ = fs::remove_dir_all(&staging).await;
        outcome
    }

    async fn fetch_into(
        &self,
        archive_path: &Path,
        staging: &Path,
    ) -> Result<IntegrityMarker, DatasetError> {
        let key = &self.config.key;
        let bytes = self
            .store
            .download(key, archive_path)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(key) => DatasetError::MissingArchive(key),
                source => DatasetError::Download {
                    key: key.clone(),
                    source,
                },
            })?;
        info!(bytes, "Downloaded dataset archive; extracting");

        let summary = archive::extract_tar_gz(archive_path, staging).await?;
        if summary.files == 0 {
            return Err(DatasetError::Empty(key.clone()));
        }

        let content_root = content_root(staging, &self.config.name).await?;
        let target = self.dataset_dir();
        if fs::try_exists(&target).await.unwrap_or(false) {
            fs::remove_dir_all(&target)
                .await
                .map_err(|e| io_error(&target, e))?;
        }
        fs::rename(&content_root, &target)
            .await
            .map_err(|e| io_error(&target, e))?;

        let counted_dir = target.clone();
        let file_count = tokio::task::spawn_blocking(move || count_files(&counted_dir))
            .await
            .map_err(|e| io_error(&target, io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| io_error(&target, e))?;

        let marker = IntegrityMarker {
            source_key: key.clone(),
            file_count,
            completed_at: Utc::now(),
        };
        self.write_marker(&marker).await?;
        Ok(marker)
    }

    async fn write_marker(&self, marker: &IntegrityMarker) -> Result<(), DatasetError> {
        let path = self.marker_path();
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(marker)
            .map_err(|e| io_error(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut file = fs::File::create(&tmp).await.map_err(|e| io_error(&tmp, e))?;
        file.write_all(&body).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))
    }

    async fn discard_marker(&self) {
        let _ = fs::remove_file(self.marker_path()).await;
    }
}

/// Archives usually wrap the dataset in a directory named after it; use that
/// whatever else the archive carries. Otherwise fall back to a lone top-level
/// directory, then to the extraction root itself.
async fn content_root(staging: &Path, name: &str) -> Result<PathBuf, DatasetError> {
    let named = staging.join(name);
    if fs::metadata(&named).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(named);
    }

    let mut entries = fs::read_dir(staging)
        .await
        .map_err(|e| io_error(staging, e))?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(staging, e))? {
        children.push(entry);
    }

    if let [only] = children.as_slice() {
        let is_dir = only
            .file_type()
            .await
            .map_err(|e| io_error(staging, e))?
            .is_dir();
        if is_dir {
            return Ok(only.path());
        }
    }
    Ok(staging.to_path_buf())
}

fn io_error(path: &Path, source: io::Error) -> DatasetError {
    DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}
