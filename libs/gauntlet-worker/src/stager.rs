//! Submission staging.
//!
//! Each job gets its own scratch workspace. The submission archive is
//! downloaded into it, unpacked, and checked for the required entrypoint. The
//! workspace is removed when the returned [`StagedSubmission`] is dropped,
//! whatever the outcome of the job.

use gauntlet_common::error::source_chain;
use gauntlet_common::PipelineError;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{self, count_files, ArchiveError};
use crate::store::{RemoteStore, StoreError};

const ARCHIVE_NAME: &str = "submission.tar.gz";
const CONTENT_DIR: &str = "submission";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("submission not found: {0}")]
    MissingObject(String),

    #[error("failed to download submission {key}")]
    Transfer {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to prepare submission workspace")]
    Workspace(#[source] io::Error),

    #[error("failed to extract submission {key}")]
    Extraction {
        key: String,
        #[source]
        source: ArchiveError,
    },

    #[error("submission {0} contained no files")]
    Empty(String),

    #[error("{0} not found in submission")]
    MissingEntrypoint(String),
}

impl From<StagingError> for PipelineError {
    fn from(err: StagingError) -> Self {
        PipelineError::Staging {
            message: err.to_string(),
            detail: source_chain(&err),
        }
    }
}

/// An extracted submission. The scratch workspace lives as long as this value.
#[derive(Debug)]
pub struct StagedSubmission {
    workspace: TempDir,
    root: PathBuf,
    pub file_count: usize,
}

impl StagedSubmission {
    /// Directory holding the extracted submission files.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionStager {
    store: RemoteStore,
    required_entrypoint: Option<String>,
    scratch_root: Option<PathBuf>,
}

impl SubmissionStager {
    pub fn new(store: RemoteStore, required_entrypoint: Option<String>) -> Self {
        Self {
            store,
            required_entrypoint,
            scratch_root: None,
        }
    }

    /// Create workspaces under `root` instead of the system temp directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub async fn stage(&self, key: &str) -> Result<StagedSubmission, StagingError> {
        let present = self
            .store
            .exists(key)
            .await
            .map_err(|source| StagingError::Transfer {
                key: key.to_string(),
                source,
            })?;
        if !present {
            return Err(StagingError::MissingObject(key.to_string()));
        }

        let workspace = self.workspace()?;
        let archive_path = workspace.path().join(ARCHIVE_NAME);
        let root = workspace.path().join(CONTENT_DIR);

        self.store
            .download(key, &archive_path)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(key) => StagingError::MissingObject(key),
                source => StagingError::Transfer {
                    key: key.to_string(),
                    source,
                },
            })?;

        let summary = archive::extract_tar_gz(&archive_path, &root)
            .await
            .map_err(|source| StagingError::Extraction {
                key: key.to_string(),
                source,
            })?;
        let _ = tokio::fs::remove_file(&archive_path).await;

        if summary.files == 0 {
            return Err(StagingError::Empty(key.to_string()));
        }

        if let Some(entrypoint) = &self.required_entrypoint {
            if !tokio::fs::metadata(root.join(entrypoint))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Err(StagingError::MissingEntrypoint(entrypoint.clone()));
            }
        }

        let counted = root.clone();
        let file_count = tokio::task::spawn_blocking(move || count_files(&counted))
            .await
            .map_err(|e| StagingError::Workspace(io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(StagingError::Workspace)?;

        info!(key, files = file_count, path = %root.display(), "Submission staged");
        Ok(StagedSubmission {
            workspace,
            root,
            file_count,
        })
    }

    fn workspace(&self) -> Result<TempDir, StagingError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("submission-");
        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(StagingError::Workspace)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(StagingError::Workspace)?;

        debug!(path = %dir.path().display(), "Created submission workspace");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, put, seed_submission, tar_gz};
    use gauntlet_common::ErrorKind;

    fn stager(store: &crate::store::RemoteStore, scratch: &Path) -> SubmissionStager {
        SubmissionStager::new(store.clone(), Some("predict.py".to_string()))
            .with_scratch_root(scratch)
    }

    #[tokio::test]
    async fn test_missing_submission_is_reported() {
        let store = memory_store();
        let scratch = tempfile::tempdir().unwrap();

        let err = stager(&store, scratch.path())
            .stage("submissions/ghost.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::MissingObject(_)));

        let failure: PipelineError = err.into();
        assert_eq!(failure.kind(), ErrorKind::StagingError);
        assert!(failure.to_string().contains("submissions/ghost.tar.gz"));
    }

    #[tokio::test]
    async fn test_empty_archive_is_rejected() {
        let store = memory_store();
        put(&store, "submissions/empty.tar.gz", tar_gz(&[])).await;
        let scratch = tempfile::tempdir().unwrap();

        let err = stager(&store, scratch.path())
            .stage("submissions/empty.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Empty(_)));
    }

    #[tokio::test]
    async fn test_missing_entrypoint_is_rejected() {
        let store = memory_store();
        put(
            &store,
            "submissions/no-predict.tar.gz",
            tar_gz(&[("model.py", "pass")]),
        )
        .await;
        let scratch = tempfile::tempdir().unwrap();

        let err = stager(&store, scratch.path())
            .stage("submissions/no-predict.tar.gz")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "predict.py not found in submission");
    }

    #[tokio::test]
    async fn test_entrypoint_check_can_be_disabled() {
        let store = memory_store();
        put(
            &store,
            "submissions/any.tar.gz",
            tar_gz(&[("model.py", "pass")]),
        )
        .await;
        let scratch = tempfile::tempdir().unwrap();

        let staged = SubmissionStager::new(store, None)
            .with_scratch_root(scratch.path())
            .stage("submissions/any.tar.gz")
            .await
            .unwrap();
        assert!(staged.path().join("model.py").is_file());
    }

    #[tokio::test]
    async fn test_workspace_removed_on_drop() {
        let store = memory_store();
        seed_submission(&store, "submissions/ok.tar.gz").await;
        let scratch = tempfile::tempdir().unwrap();

        let staged = stager(&store, scratch.path())
            .stage("submissions/ok.tar.gz")
            .await
            .unwrap();
        let workspace = staged.workspace().to_path_buf();

        assert_eq!(staged.file_count, 1);
        assert!(staged.path().join("predict.py").is_file());
        assert!(!workspace.join(ARCHIVE_NAME).exists());

        drop(staged);
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_failed_staging_leaves_no_workspace() {
        let store = memory_store();
        put(&store, "submissions/bad.tar.gz", b"garbage".to_vec()).await;
        let scratch = tempfile::tempdir().unwrap();

        let err = stager(&store, scratch.path())
            .stage("submissions/bad.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Extraction { .. }));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
