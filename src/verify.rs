//! Verification runs for flagged items.
//!
//! Every flagged item first gets a pending status artifact so the report can
//! render before any job starts. Items of repositories that opted out of
//! parallel runs execute one at a time; all others share a bounded pool.
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, instrument, warn};

use crate::model::FlaggedItem;

const PENDING_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16" viewBox="0 0 16 16"><circle cx="8" cy="8" r="7" fill="none" stroke="#888" stroke-width="1.5"/><path d="M8 4v4l3 2" fill="none" stroke="#888" stroke-width="1.5"/></svg>"##;
const PASSED_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16" viewBox="0 0 16 16"><circle cx="8" cy="8" r="8" fill="#2e7d32"/><path d="M4 8l3 3 5-6" fill="none" stroke="#fff" stroke-width="2"/></svg>"##;
const FAILED_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16" viewBox="0 0 16 16"><circle cx="8" cy="8" r="8" fill="#c62828"/><path d="M5 5l6 6M11 5l-6 6" stroke="#fff" stroke-width="2"/></svg>"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Pending,
    Running,
    Passed,
    Failed,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "PENDING",
            VerificationState::Running => "RUNNING",
            VerificationState::Passed => "PASSED",
            VerificationState::Failed => "FAILED",
        }
    }

    /// Status indicator written to the item's `.svg` artifact.
    pub fn indicator(&self) -> &'static str {
        match self {
            VerificationState::Pending | VerificationState::Running => PENDING_SVG,
            VerificationState::Passed => PASSED_SVG,
            VerificationState::Failed => FAILED_SVG,
        }
    }

    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            VerificationState::Passed
        } else {
            VerificationState::Failed
        }
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    /// The job could not be driven at all (checkout failed, spawn failed).
    #[error("verification driver failed: {0}")]
    Driver(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub source_repository: String,
    pub branch: String,
    pub output_dir: PathBuf,
    pub item_id: String,
    pub parallel: bool,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub exit_code: i32,
    pub log: String,
}

/// External verification command for one item.
#[async_trait]
pub trait VerificationJob: Send + Sync {
    async fn run(&self, request: &VerificationRequest) -> Result<JobOutput, VerificationError>;
}

/// Clones the item's branch and runs a test command (`tox` by default) in it.
#[derive(Debug, Clone)]
pub struct CommandJob {
    program: String,
}

impl CommandJob {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// `lp:` references are cloned over https from git.launchpad.net.
fn clone_url(repository: &str) -> String {
    match repository.strip_prefix("lp:") {
        Some(rest) => format!("https://git.launchpad.net/{}", rest),
        None => repository.to_string(),
    }
}

#[async_trait]
impl VerificationJob for CommandJob {
    async fn run(&self, request: &VerificationRequest) -> Result<JobOutput, VerificationError> {
        let work_dir = request.output_dir.join("work");
        tokio::fs::create_dir_all(&work_dir).await?;
        let checkout = work_dir.join(&request.item_id);
        if tokio::fs::try_exists(&checkout).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&checkout).await?;
        }

        let clone = Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(&request.branch)
            .arg(clone_url(&request.source_repository))
            .arg(checkout.as_os_str())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VerificationError::Driver(format!("failed to spawn git: {}", e)))?;
        if !clone.status.success() {
            return Err(VerificationError::Driver(format!(
                "git clone exited with status {}: {}",
                clone.status,
                String::from_utf8_lossy(&clone.stderr).trim()
            )));
        }

        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&checkout);
        if let Some(env) = &request.environment {
            cmd.arg("-e").arg(env);
        }
        if request.parallel {
            cmd.arg("--parallel").arg("auto");
        }
        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VerificationError::Driver(format!("failed to spawn {}: {}", self.program, e)))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        if let Err(err) = tokio::fs::remove_dir_all(&checkout).await {
            warn!(?err, path = %checkout.display(), "failed to clean checkout");
        }
        Ok(JobOutput {
            exit_code: output.status.code().unwrap_or(1),
            log,
        })
    }
}

/// Status indicator and log files, keyed by item id.
#[derive(Debug, Clone)]
pub struct StatusArtifacts {
    dir: PathBuf,
}

impl StatusArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn indicator_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{}.svg", item_id))
    }

    pub fn log_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", item_id))
    }

    /// Overwrite both artifacts of `item_id`.
    pub async fn publish(&self, item_id: &str, state: VerificationState, log: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let indicator = self.indicator_path(item_id);
        tokio::fs::write(&indicator, state.indicator())
            .await
            .with_context(|| format!("failed to write {}", indicator.display()))?;
        let log_path = self.log_path(item_id);
        tokio::fs::write(&log_path, log)
            .await
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        Ok(())
    }
}

/// Maximum number of concurrent jobs in the parallel batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLimit {
    Bounded(NonZeroUsize),
    /// As many as the machine offers.
    Unbounded,
}

impl JobLimit {
    /// Positive values bound the pool; zero or negative (`-1`) mean unbounded.
    pub fn from_jobs(jobs: i64) -> Self {
        usize::try_from(jobs)
            .ok()
            .and_then(NonZeroUsize::new)
            .map_or(JobLimit::Unbounded, JobLimit::Bounded)
    }

    pub fn concurrency(&self) -> usize {
        match self {
            JobLimit::Bounded(n) => n.get(),
            JobLimit::Unbounded => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

/// Flagged items split by execution mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub serial: Vec<FlaggedItem>,
    pub parallel: Vec<FlaggedItem>,
}

pub fn partition(flagged: Vec<FlaggedItem>) -> Partition {
    let (parallel, serial) = flagged.into_iter().partition(|item| item.parallel);
    Partition { serial, parallel }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub item_id: String,
    pub repository: String,
    pub exit_code: i32,
    pub state: VerificationState,
}

pub struct VerificationScheduler<J> {
    job: J,
    artifacts: StatusArtifacts,
    limit: JobLimit,
}

impl<J: VerificationJob> VerificationScheduler<J> {
    pub fn new(job: J, output_dir: impl Into<PathBuf>, limit: JobLimit) -> Self {
        Self {
            job,
            artifacts: StatusArtifacts::new(output_dir),
            limit,
        }
    }

    pub fn artifacts(&self) -> &StatusArtifacts {
        &self.artifacts
    }

    /// Publish a pending indicator and an empty log for every flagged item.
    pub async fn prepare(&self, flagged: &[FlaggedItem]) -> Result<()> {
        for item in flagged {
            self.artifacts
                .publish(&item.id, VerificationState::Pending, "")
                .await?;
        }
        info!(count = flagged.len(), "published pending verification state");
        Ok(())
    }

    /// Run the serial batch to completion, then the parallel batch.
    #[instrument(skip_all)]
    pub async fn run(&self, flagged: Vec<FlaggedItem>) -> Vec<VerificationOutcome> {
        let Partition { serial, parallel } = partition(flagged);
        let mut outcomes = Vec::with_capacity(serial.len() + parallel.len());

        info!(count = serial.len(), "running verification without parallelization");
        for item in serial {
            outcomes.push(self.run_one(item, false).await);
        }

        let concurrency = self.limit.concurrency();
        info!(count = parallel.len(), concurrency, "running remaining verification in parallel");
        let parallel_outcomes: Vec<VerificationOutcome> = stream::iter(parallel)
            .map(|item| self.run_one(item, true))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.extend(parallel_outcomes);
        outcomes
    }

    #[instrument(skip_all, fields(item = %item.id, parallel = parallel))]
    async fn run_one(&self, item: FlaggedItem, parallel: bool) -> VerificationOutcome {
        info!(
            item = %item.id,
            repo = %item.repository,
            state = VerificationState::Running.as_str(),
            "starting verification"
        );
        let (exit_code, log) = match &item.source {
            None => {
                warn!(item = %item.id, "item has no source branch to verify");
                (1, "no source branch available for verification\n".to_string())
            }
            Some(source) => {
                let request = VerificationRequest {
                    source_repository: source.repository.clone(),
                    branch: source.branch.clone(),
                    output_dir: self.artifacts.dir().to_path_buf(),
                    item_id: item.id.clone(),
                    parallel,
                    environment: item.environment.clone(),
                };
                match self.job.run(&request).await {
                    Ok(output) => (output.exit_code, output.log),
                    Err(err) => {
                        error!(
                            ?err,
                            repo = %source.repository,
                            branch = %source.branch,
                            "verification driver failed"
                        );
                        (1, format!("{}\n", err))
                    }
                }
            }
        };

        let state = VerificationState::from_exit_code(exit_code);
        if let Err(err) = self.artifacts.publish(&item.id, state, &log).await {
            warn!(?err, item = %item.id, "failed to publish verification state");
        }
        info!(item = %item.id, exit_code, state = state.as_str(), "verification finished");
        VerificationOutcome {
            item_id: item.id,
            repository: item.repository,
            exit_code,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BranchRef;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    fn flagged(id: &str, parallel: bool) -> FlaggedItem {
        FlaggedItem {
            id: id.into(),
            url: format!("https://lp/+merge/{}", id),
            repository: "proj".into(),
            source: Some(BranchRef {
                repository: "lp:~dev/proj".into(),
                branch: format!("branch-{}", id),
            }),
            environment: None,
            parallel,
        }
    }

    #[derive(Clone, Default)]
    struct SerialProbe {
        active_serial: Arc<Mutex<usize>>,
        max_serial: Arc<Mutex<usize>>,
        calls: Arc<Mutex<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl VerificationJob for SerialProbe {
        async fn run(&self, request: &VerificationRequest) -> Result<JobOutput, VerificationError> {
            self.calls
                .lock()
                .await
                .push((request.item_id.clone(), request.parallel));
            if !request.parallel {
                let mut active = self.active_serial.lock().await;
                *active += 1;
                let mut max = self.max_serial.lock().await;
                *max = (*max).max(*active);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if !request.parallel {
                *self.active_serial.lock().await -= 1;
            }
            Ok(JobOutput {
                exit_code: 0,
                log: "ok".into(),
            })
        }
    }

    #[test]
    fn partition_keeps_opted_out_items_serial() {
        let p = partition(vec![flagged("1", true), flagged("2", false), flagged("3", true)]);
        let serial: Vec<&str> = p.serial.iter().map(|i| i.id.as_str()).collect();
        let parallel: Vec<&str> = p.parallel.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(serial, vec!["2"]);
        assert_eq!(parallel, vec!["1", "3"]);
    }

    #[test]
    fn job_limit_from_jobs() {
        assert_eq!(JobLimit::from_jobs(-1), JobLimit::Unbounded);
        assert_eq!(JobLimit::from_jobs(0), JobLimit::Unbounded);
        assert_eq!(JobLimit::from_jobs(4).concurrency(), 4);
        assert!(JobLimit::Unbounded.concurrency() >= 1);
    }

    #[test]
    fn exit_codes_map_to_states() {
        assert_eq!(VerificationState::from_exit_code(0), VerificationState::Passed);
        assert_eq!(VerificationState::from_exit_code(2), VerificationState::Failed);
        assert_eq!(VerificationState::from_exit_code(-1), VerificationState::Failed);
    }

    #[tokio::test]
    async fn serial_items_run_one_at_a_time_with_serial_invocation() {
        let td = tempdir().unwrap();
        let probe = SerialProbe::default();
        let scheduler =
            VerificationScheduler::new(probe.clone(), td.path(), JobLimit::from_jobs(4));
        let items = vec![
            flagged("1", false),
            flagged("2", true),
            flagged("3", false),
            flagged("4", true),
        ];
        let outcomes = scheduler.run(items).await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.state == VerificationState::Passed));
        assert_eq!(*probe.max_serial.lock().await, 1);

        let calls = probe.calls.lock().await.clone();
        assert_eq!(calls[0], ("1".to_string(), false));
        assert_eq!(calls[1], ("3".to_string(), false));
        assert!(calls[2..].iter().all(|(_, parallel)| *parallel));
    }

    #[tokio::test]
    async fn prepare_writes_pending_artifacts() {
        let td = tempdir().unwrap();
        let scheduler =
            VerificationScheduler::new(SerialProbe::default(), td.path(), JobLimit::Unbounded);
        scheduler.prepare(&[flagged("9", true)]).await.unwrap();
        let svg = std::fs::read_to_string(scheduler.artifacts().indicator_path("9")).unwrap();
        let log = std::fs::read_to_string(scheduler.artifacts().log_path("9")).unwrap();
        assert_eq!(svg, VerificationState::Pending.indicator());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn item_without_source_fails() {
        let td = tempdir().unwrap();
        let scheduler =
            VerificationScheduler::new(SerialProbe::default(), td.path(), JobLimit::Unbounded);
        let mut item = flagged("5", true);
        item.source = None;
        let outcomes = scheduler.run(vec![item]).await;
        assert_eq!(outcomes[0].state, VerificationState::Failed);
        assert_eq!(outcomes[0].exit_code, 1);
    }

    #[tokio::test]
    async fn command_job_reports_failed_checkout_as_driver_error() {
        let td = tempdir().unwrap();
        let request = VerificationRequest {
            source_repository: td.path().join("missing-repo").to_string_lossy().into_owned(),
            branch: "main".into(),
            output_dir: td.path().to_path_buf(),
            item_id: "1".into(),
            parallel: false,
            environment: None,
        };
        let result = CommandJob::new("true").run(&request).await;
        assert!(matches!(result, Err(VerificationError::Driver(_))));
    }

    #[test]
    fn launchpad_references_clone_over_https() {
        assert_eq!(clone_url("lp:~dev/proj"), "https://git.launchpad.net/~dev/proj");
        assert_eq!(clone_url("https://github.com/a/b.git"), "https://github.com/a/b.git");
    }
}
