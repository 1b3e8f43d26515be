//! Remote object store adapter.
//!
//! Wraps an `object_store` backend (S3-compatible, local filesystem, or in-memory
//! for tests) behind the four operations the pipeline needs. A missing object is
//! always reported as [`StoreError::NotFound`], never folded into a generic
//! backend failure.

use bytes::Bytes;
use futures_util::StreamExt;
use gauntlet_common::config::StoreConfig;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key {key:?}")]
    InvalidKey {
        key: String,
        #[source]
        source: object_store::path::Error,
    },

    #[error("object store request for {key} failed")]
    Backend {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("local file error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure object store: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteStore({})", self.inner)
    }
}

impl RemoteStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config {
            StoreConfig::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region);

                // S3-compatible services (R2, MinIO) need path-style requests.
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_virtual_hosted_style_request(false);
                    if endpoint.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                }
                if let Some(key_id) = access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }

                let store = builder
                    .build()
                    .map_err(|e| StoreError::Config(format!("S3: {e}")))?;
                Arc::new(store)
            }
            StoreConfig::Local { root } => {
                std::fs::create_dir_all(root).map_err(|source| StoreError::Io {
                    path: root.clone(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(root)
                    .map_err(|e| StoreError::Config(format!("LocalFileSystem: {e}")))?;
                Arc::new(store)
            }
        };

        Ok(Self::new(inner))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = object_path(key)?;
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StoreError::Backend {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Stream an object to `local_path`, creating parent directories.
    /// Returns the number of bytes written.
    pub async fn download(&self, key: &str, local_path: &Path) -> Result<u64> {
        let path = object_path(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| classify(key, e))?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
        }
        let mut file = fs::File::create(local_path)
            .await
            .map_err(|e| io_error(local_path, e))?;

        let mut written = 0u64;
        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(key, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(local_path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(local_path, e))?;

        tracing::debug!(key, bytes = written, path = %local_path.display(), "Downloaded object");
        Ok(written)
    }

    pub async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let data = fs::read(local_path)
            .await
            .map_err(|e| io_error(local_path, e))?;
        self.put_bytes(key, Bytes::from(data)).await
    }

    pub async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let path = object_path(key)?;
        let size = data.len();
        self.inner
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| classify(key, e))?;

        tracing::debug!(key, bytes = size, "Uploaded object");
        Ok(())
    }
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|source| StoreError::InvalidKey {
        key: key.to_string(),
        source,
    })
}

fn classify(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
        source => StoreError::Backend {
            key: key.to_string(),
            source,
        },
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
