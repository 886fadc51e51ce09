//! Source adapters: translate upstream review systems into the canonical
//! [`Repository`] / [`ReviewableItem`] / [`Review`] model.
//!
//! Each upstream has two layers:
//! - an API trait (`GithubApi`, `LaunchpadApi`) owning transport, auth and
//!   pagination, with a `reqwest` implementation;
//! - an adapter (`GithubSource`, `LaunchpadSource`) implementing
//!   [`SourceAdapter`] on top of any API implementation.
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::clock::{RunContext, Timestamp};
use crate::model::{Repository, Review, ReviewableItem, SourceKind};

pub mod github;
pub mod launchpad;

pub use github::{GithubApi, GithubClient, GithubSource};
pub use launchpad::{LaunchpadApi, LaunchpadClient, LaunchpadSource};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Network-level failures that abort only the current pass.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout(_) => true,
            SourceError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

/// Common contract of every upstream review system.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Resolve the configured repositories. Unknown repositories are skipped
    /// with a warning; rate limiting is warned about and the repository kept.
    async fn list_repositories(&self, ctx: &RunContext) -> Result<Vec<Repository>, SourceError>;

    /// Candidate items of `repo` with their review ledgers merged and latest
    /// activity computed.
    async fn list_items(&self, repo: &Repository) -> Result<Vec<ReviewableItem>, SourceError>;

    /// Latest of the item creation time, every comment, every issue comment
    /// and every completed review. Pending reviews must already be filtered out.
    fn compute_latest_activity(
        &self,
        created_at: Timestamp,
        comments: &[Timestamp],
        issue_comments: &[Timestamp],
        reviews: &[Review],
    ) -> Timestamp {
        issue_comments
            .iter()
            .chain(comments.iter())
            .chain(reviews.iter().map(|r| &r.submitted_at))
            .fold(created_at, |latest, ts| if *ts > latest { *ts } else { latest })
    }
}

/// Result of a per-repository lookup after applying the skip/continue rules.
pub(crate) enum Resolved<T> {
    Found(T),
    RateLimited,
    Skip,
}

/// Apply the not-found / rate-limit recovery rules to a repository lookup.
pub(crate) fn resolve_or_recover<T>(
    reference: &str,
    result: Result<T, SourceError>,
) -> Result<Resolved<T>, SourceError> {
    match result {
        Ok(found) => Ok(Resolved::Found(found)),
        Err(SourceError::NotFound(detail)) => {
            warn!(
                repo = %reference,
                %detail,
                "repository was not found; check credentials and repository name; skipping"
            );
            Ok(Resolved::Skip)
        }
        Err(SourceError::RateLimited(detail)) => {
            warn!(
                repo = %reference,
                %detail,
                "rate limit exceeded; repository may be incomplete"
            );
            Ok(Resolved::RateLimited)
        }
        Err(err) => Err(err),
    }
}

/// Degrade a rate-limited sub-fetch to an empty (partial) result.
pub(crate) fn or_partial<T>(
    context: &str,
    result: Result<Vec<T>, SourceError>,
) -> Result<Vec<T>, SourceError> {
    match result {
        Err(SourceError::RateLimited(detail)) => {
            warn!(item = %context, %detail, "rate limit exceeded; data may be incomplete");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Page `result` of a paginated fetch that already holds `fetched` entries.
/// A rate limit after the first page ends paging (`None`) and keeps what was
/// fetched; every other outcome passes through.
pub(crate) fn next_page<T>(
    context: &str,
    fetched: usize,
    result: Result<T, SourceError>,
) -> Result<Option<T>, SourceError> {
    match result {
        Ok(page) => Ok(Some(page)),
        Err(SourceError::RateLimited(detail)) if fetched > 0 => {
            warn!(link = %context, fetched, %detail, "rate limit exceeded while paging; keeping fetched entries");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
