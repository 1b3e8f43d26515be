// CLI commands for running evaluations and managing the dataset cache
use anyhow::{bail, Context, Result};
use gauntlet_common::{
    Config, EvaluationRequest, Job, JobRegistry, JobStatus, Transition,
};
use gauntlet_worker::{DatasetCache, IntegrityMarker, Pipeline, RemoteStore};
use std::path::Path;

/// Evaluate one submission in-process, the same way the API worker would.
pub async fn run_evaluation(
    config: &Config,
    submission_key: &str,
    name: &str,
    quick: bool,
    submission_id: Option<i64>,
) -> Result<()> {
    if submission_key.trim().is_empty() {
        bail!("Submission key cannot be empty");
    }

    let pipeline = Pipeline::from_config(config).context("Failed to open object store")?;
    let registry = JobRegistry::new();
    let job = registry
        .create(EvaluationRequest {
            submission_reference: submission_key.to_string(),
            display_name: name.to_string(),
            quick_mode: quick,
            submission_id,
        })
        .await;

    eprintln!("🚀 Evaluating {} ({} mode)", submission_key, job.mode());

    let started = registry
        .transition(&job.id, Transition::Start)
        .await
        .context("Failed to start job")?;
    let transition = match pipeline.run(&started).await {
        Ok(result) => Transition::Complete(result),
        Err(e) => Transition::Fail(e.to_job_error()),
    };
    let finished = registry
        .transition(&job.id, transition)
        .await
        .context("Failed to record job outcome")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&finished).context("Failed to serialize job")?
    );
    report_outcome(&finished)
}

fn report_outcome(job: &Job) -> Result<()> {
    match (&job.status, &job.result, &job.error) {
        (JobStatus::Completed, Some(result), _) => {
            eprintln!("✓ Evaluation completed in {:.1}s", result.eval_time_secs);
            eprintln!("  Results: {}", result.result_key);
            Ok(())
        }
        (_, _, Some(error)) => {
            eprintln!("✗ Evaluation failed ({})", error.kind);
            bail!("{}", error.message)
        }
        _ => bail!("Job {} ended in unexpected state {}", job.id, job.status),
    }
}

/// Make sure the reference dataset is downloaded and extracted.
pub async fn warm_cache(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    println!("🔍 Checking dataset cache at {}", cache.dataset_dir().display());

    let path = cache
        .ensure_ready()
        .await
        .context("Failed to prepare reference dataset")?;

    if cache.downloads() == 0 {
        println!("✓ Dataset already cached at {}", path.display());
    } else {
        println!("✓ Dataset downloaded to {}", path.display());
    }
    Ok(())
}

/// Report the state of the on-disk cache without fetching anything.
pub async fn cache_status(config: &Config, json: bool) -> Result<()> {
    let cache = open_cache(config)?;
    let marker = cache.inspect().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&marker).context("Failed to serialize marker")?
        );
    } else {
        println!("{}", describe_cache(&cache.dataset_dir(), marker.as_ref()));
    }
    Ok(())
}

fn open_cache(config: &Config) -> Result<DatasetCache> {
    let store = RemoteStore::from_config(&config.store).context("Failed to open object store")?;
    Ok(DatasetCache::new(config.dataset.clone(), store))
}

fn describe_cache(dir: &Path, marker: Option<&IntegrityMarker>) -> String {
    match marker {
        Some(marker) => format!(
            "✓ ready: {} ({} files from {}, completed {})",
            dir.display(),
            marker.file_count,
            marker.source_key,
            marker.completed_at.to_rfc3339()
        ),
        None => format!("✗ absent: {} (run `gauntlet-cli warm-cache`)", dir.display()),
    }
}
