use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::keys::DEFAULT_RESULTS_PREFIX;

/// Largest accepted intake buffer. Channel permits are finite and every slot
/// is reserved up front.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("unknown storage backend {0:?} (expected \"s3\" or \"local\")")]
    UnknownBackend(String),
}

/// Where remote artifacts (dataset archive, submissions, results) live.
#[derive(Clone, PartialEq)]
pub enum StoreConfig {
    /// Any S3-compatible service (AWS, R2, MinIO).
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: String,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
    /// A directory on the local filesystem, mostly for development.
    Local { root: PathBuf },
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfig::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
            } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("endpoint", endpoint)
                .field("region", region)
                .field("access_key_id", access_key_id)
                .field(
                    "secret_access_key",
                    &secret_access_key.as_ref().map(|_| "<redacted>"),
                )
                .finish(),
            StoreConfig::Local { root } => f.debug_struct("Local").field("root", root).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    /// Object-store key of the dataset archive.
    pub key: String,
    /// Directory name of the extracted dataset under `cache_root`.
    pub name: String,
    pub cache_root: PathBuf,
    pub warm_on_startup: bool,
}

impl DatasetConfig {
    pub fn dataset_dir(&self) -> PathBuf {
        self.cache_root.join(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorConfig {
    pub program: String,
    /// Argument template; `{submission}`, `{dataset}`, `{output}` are substituted.
    pub args: Vec<String>,
    /// Extra arguments appended in quick mode; `{sample}` is substituted.
    pub quick_args: Vec<String>,
    pub quick_sample_size: u32,
    pub timeout: Duration,
    /// Dependency installation run inside the submission directory when it
    /// ships a `requirements.txt`.
    pub setup_command: Option<Vec<String>>,
    pub setup_timeout: Duration,
    /// Directory the routine is started from.
    pub working_dir: Option<PathBuf>,
    /// File that must exist at the root of an extracted submission.
    pub required_entrypoint: Option<String>,
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: String,
    pub store: StoreConfig,
    pub dataset: DatasetConfig,
    pub evaluator: EvaluatorConfig,
    pub results_prefix: String,
    pub queue_capacity: usize,
    pub job_retention: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let store = match vars.string_or("STORE_BACKEND", "s3").to_lowercase().as_str() {
            "s3" => StoreConfig::S3 {
                bucket: vars.string_or("STORE_BUCKET", "evaluations"),
                endpoint: vars.non_empty("STORE_ENDPOINT_URL"),
                region: vars.string_or("STORE_REGION", "auto"),
                access_key_id: vars.non_empty("STORE_ACCESS_KEY_ID"),
                secret_access_key: vars.non_empty("STORE_SECRET_ACCESS_KEY"),
            },
            "local" => StoreConfig::Local {
                root: PathBuf::from(vars.string_or("STORE_LOCAL_ROOT", "./object-store")),
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let dataset = DatasetConfig {
            key: vars.string_or("DATASET_KEY", "private/dataset_test.tar.gz"),
            name: vars.string_or("DATASET_NAME", "dataset_test"),
            cache_root: vars
                .non_empty("DATASET_CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_root),
            warm_on_startup: vars.parse_or("WARM_DATASET_ON_STARTUP", true)?,
        };

        let evaluator = EvaluatorConfig {
            program: vars.string_or("EVAL_PROGRAM", "python3"),
            args: split_args(&vars.string_or(
                "EVAL_ARGS",
                "evaluate.py {submission} {dataset} -o {output}",
            )),
            quick_args: split_args(&vars.string_or("EVAL_QUICK_ARGS", "-n {sample}")),
            quick_sample_size: vars.parse_or("QUICK_SAMPLE_SIZE", 100)?,
            timeout: Duration::from_secs(vars.parse_within(
                "EVAL_TIMEOUT_SECS",
                900,
                1..=u64::MAX,
            )?),
            setup_command: vars
                .disableable("SETUP_COMMAND", "pip install -q -r requirements.txt")
                .map(|cmd| split_args(&cmd)),
            setup_timeout: Duration::from_secs(vars.parse_within(
                "SETUP_TIMEOUT_SECS",
                300,
                1..=u64::MAX,
            )?),
            working_dir: vars.non_empty("EVAL_WORKING_DIR").map(PathBuf::from),
            required_entrypoint: vars.disableable("REQUIRED_ENTRYPOINT", "predict.py"),
        };

        let job_retention = match vars.non_empty("JOB_RETENTION_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("JOB_RETENTION_SECS", &raw)?)),
            None => None,
        };

        Ok(Self {
            bind_addr: vars.string_or("BIND_ADDR", "0.0.0.0:8000"),
            store,
            dataset,
            evaluator,
            results_prefix: vars.string_or("RESULTS_PREFIX", DEFAULT_RESULTS_PREFIX),
            queue_capacity: vars.parse_within("QUEUE_CAPACITY", 256, 1..=MAX_QUEUE_CAPACITY)?,
            job_retention,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.non_empty(key).unwrap_or_else(|| default.to_string())
    }

    /// Unset means `default`; set to an empty string means disabled.
    fn disableable(&self, key: &str, default: &str) -> Option<String> {
        match (self.0)(key) {
            None => Some(default.to_string()),
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
        }
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.non_empty(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Like `parse_or`, but an explicit value outside `bounds` is invalid.
    fn parse_within<T>(
        &self,
        key: &str,
        default: T,
        bounds: RangeInclusive<T>,
    ) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd,
    {
        match self.non_empty(key) {
            Some(raw) => {
                let value: T = parse_value(key, &raw)?;
                if bounds.contains(&value) {
                    Ok(value)
                } else {
                    Err(ConfigError::Invalid {
                        key: key.to_string(),
                        value: raw,
                    })
                }
            }
            None => Ok(default),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn default_cache_root() -> PathBuf {
    let workspace = Path::new("/workspace");
    if workspace.is_dir() {
        workspace.to_path_buf()
    } else {
        env::temp_dir()
    }
}
