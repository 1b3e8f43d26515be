/// Evaluation Engine - Abstraction over the scoring routine
///
/// **Core Responsibility:**
/// Run the evaluation routine against one staged submission and the cached
/// reference dataset, and hand back the JSON report it produced.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to run the routine (local process, container, ...)
/// - Engine does NOT enforce the job time budget (the executor does)
/// - Engine does NOT publish anything
///
/// `CommandEngine` is the production implementation: it spawns a configurable
/// program in its own process group and kills the group when the future is
/// dropped, so aborting an evaluation also stops whatever the routine started.

use async_trait::async_trait;
use gauntlet_common::config::EvaluatorConfig;
use gauntlet_common::EvalMode;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on the stderr kept in a job's failure detail.
pub const STDERR_TAIL_BYTES: usize = 4096;

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// What a finished evaluation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutput {
    /// Full JSON report written by the routine.
    pub report: Value,
    pub elapsed: Duration,
}

impl EvaluationOutput {
    /// The report's `metrics` object, or the whole report when it has none.
    pub fn metrics(&self) -> Value {
        match self.report.get("metrics") {
            Some(metrics) => metrics.clone(),
            None => self.report.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("dependency installation timed out after {}s", .0.as_secs())]
    SetupTimeout(Duration),

    #[error("evaluation report not written to {}", .path.display())]
    ReportMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("evaluation report is not valid JSON")]
    ReportInvalid(#[source] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    /// Diagnostic detail safe to store on a job record.
    pub fn detail(&self) -> Option<String> {
        match self {
            EngineError::Exit { stderr, .. } if !stderr.trim().is_empty() => {
                Some(stderr.clone())
            }
            EngineError::Exit { .. } | EngineError::Failed(_) | EngineError::SetupTimeout(_) => {
                None
            }
            EngineError::Spawn { source, .. } => Some(source.to_string()),
            EngineError::ReportMissing { source, .. } => Some(source.to_string()),
            EngineError::ReportInvalid(source) => Some(source.to_string()),
        }
    }
}

/// Evaluation engine trait
///
/// Implementations must return the routine's JSON report, or an error
/// describing why none was produced.
#[async_trait]
pub trait EvaluationEngine: Send + Sync {
    /// One-off setup for a staged submission, run before the evaluation budget
    /// starts.
    async fn prepare(&self, _submission: &Path) -> Result<(), EngineError> {
        Ok(())
    }

    async fn evaluate(
        &self,
        dataset: &Path,
        submission: &Path,
        mode: EvalMode,
    ) -> Result<Value, EngineError>;
}

/// Runs the evaluation routine as a child process.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    quick_args: Vec<String>,
    quick_sample_size: u32,
    setup_command: Option<Vec<String>>,
    setup_timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandEngine {
    pub fn from_config(config: &EvaluatorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            quick_args: config.quick_args.clone(),
            quick_sample_size: config.quick_sample_size,
            setup_command: config.setup_command.clone(),
            setup_timeout: config.setup_timeout,
            working_dir: config.working_dir.clone(),
        }
    }

    fn render_args(
        &self,
        dataset: &Path,
        submission: &Path,
        output: &Path,
        mode: EvalMode,
    ) -> Vec<String> {
        let sample = self.quick_sample_size.to_string();
        let substitute = |arg: &String| {
            arg.replace("{submission}", &submission.to_string_lossy())
                .replace("{dataset}", &dataset.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
                .replace("{sample}", &sample)
        };

        let mut rendered: Vec<String> = self.args.iter().map(substitute).collect();
        if mode.is_quick() {
            rendered.extend(self.quick_args.iter().map(substitute));
        }
        rendered
    }

    async fn install_dependencies(&self, submission: &Path) -> Result<(), EngineError> {
        let Some((program, args)) = self
            .setup_command
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            return Ok(());
        };
        if !tokio::fs::try_exists(submission.join(REQUIREMENTS_FILE))
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }

        info!(program = %program, "Installing submission dependencies");
        let mut command = Command::new(program);
        command.args(args).current_dir(submission);
        let (child, _group) = spawn_grouped(&mut command, program)?;

        let output = tokio::time::timeout(self.setup_timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::SetupTimeout(self.setup_timeout))?
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                program: program.clone(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EvaluationEngine for CommandEngine {
    async fn prepare(&self, submission: &Path) -> Result<(), EngineError> {
        self.install_dependencies(submission).await
    }

    async fn evaluate(
        &self,
        dataset: &Path,
        submission: &Path,
        mode: EvalMode,
    ) -> Result<Value, EngineError> {
        // Written beside the submission so the routine never sees its own report
        // as part of the submission tree.
        let report_path =
            submission.with_file_name(format!("results-{}.json", Uuid::new_v4().simple()));
        let args = self.render_args(dataset, submission, &report_path, mode);
        debug!(program = %self.program, ?args, "Spawning evaluation routine");

        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let (child, _group) = spawn_grouped(&mut command, &self.program)?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            warn!(program = %self.program, status = %output.status, "Evaluation routine failed");
            return Err(EngineError::Exit {
                program: self.program.clone(),
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }

        let raw = tokio::fs::read(&report_path)
            .await
            .map_err(|source| EngineError::ReportMissing {
                path: report_path.clone(),
                source,
            })?;
        let _ = tokio::fs::remove_file(&report_path).await;

        serde_json::from_slice(&raw).map_err(EngineError::ReportInvalid)
    }
}

/// Kills a child's whole process group when dropped, including on abort.
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.0.and_then(|id| i32::try_from(id).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            // ESRCH once every member has exited.
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
}

/// Spawn `command` with piped output as the leader of a new process group.
fn spawn_grouped(
    command: &mut Command,
    program: &str,
) -> Result<(Child, ProcessGroup), EngineError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|source| EngineError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let group = ProcessGroup(child.id());
    Ok((child, group))
}

/// Last `STDERR_TAIL_BYTES` of a process's stderr, lossily decoded.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
