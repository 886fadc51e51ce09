//! One aggregation pass: fetch, report, verify.
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::aggregate::{self, AggregateError};
use crate::clock::RunContext;
use crate::report;
use crate::reporters::{self, Reporter};
use crate::source::SourceAdapter;
use crate::verify::{VerificationJob, VerificationOutcome, VerificationScheduler};

#[derive(Debug, Clone)]
pub struct PassSummary {
    pub repositories: usize,
    pub items: usize,
    pub flagged: usize,
    pub report_path: PathBuf,
    pub outcomes: Vec<VerificationOutcome>,
}

/// Run a full pass against `ctx.now`.
///
/// When a scheduler is given, every flagged item gets a pending artifact
/// before the report is written, and the jobs run after it.
#[instrument(skip_all, fields(now = %ctx.now))]
pub async fn run_pass<J: VerificationJob>(
    adapters: &[Box<dyn SourceAdapter>],
    reporters: &[Box<dyn Reporter>],
    scheduler: Option<&VerificationScheduler<J>>,
    output_dir: &Path,
    ctx: &RunContext,
) -> Result<PassSummary> {
    let repos = aggregate::aggregate(adapters, ctx).await?;
    let flagged = aggregate::flagged_items(&repos);

    if let Some(scheduler) = scheduler {
        scheduler.prepare(&flagged).await?;
    }

    let data = report::build(&repos, ctx);
    reporters::run_all(reporters, &data, ctx).await;
    let report_path = report::write(output_dir, &data, scheduler.is_some()).await?;

    let flagged_count = flagged.len();
    let outcomes = match scheduler {
        Some(scheduler) => scheduler.run(flagged).await,
        None => Vec::new(),
    };

    let summary = PassSummary {
        repositories: repos.len(),
        items: repos.iter().map(|r| r.items.len()).sum(),
        flagged: flagged_count,
        report_path,
        outcomes,
    };
    info!(
        repositories = summary.repositories,
        items = summary.items,
        flagged = summary.flagged,
        "pass complete"
    );
    Ok(summary)
}

/// Failures that only abandon the current pass.
pub fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AggregateError>(),
        Some(AggregateError::TransientNetwork(_))
    )
}
