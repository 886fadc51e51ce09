//! Builds the canonical repository set from every configured source and
//! classifies which items need a verification run.
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::clock::RunContext;
use crate::model::{FlaggedItem, Repository, ReviewableItem};
use crate::source::{SourceAdapter, SourceError};

#[derive(Debug, Error)]
pub enum AggregateError {
    /// Timeouts and connection failures; only the current pass is abandoned.
    #[error("transient network failure: {0}")]
    TransientNetwork(#[source] SourceError),
    #[error("source failure: {0}")]
    Source(#[source] SourceError),
}

impl From<SourceError> for AggregateError {
    fn from(err: SourceError) -> Self {
        if err.is_transient() {
            AggregateError::TransientNetwork(err)
        } else {
            AggregateError::Source(err)
        }
    }
}

/// An item needs verification when its repository opted in and the item is
/// exactly in the source's "needs review" state.
pub fn requires_verification(repo: &Repository, item: &ReviewableItem) -> bool {
    repo.verification.enabled && item.state == repo.source_kind.needs_review_state()
}

/// Run every adapter in order and return the repositories that ended up with
/// at least one item, in adapter-then-discovery order.
#[instrument(skip_all)]
pub async fn aggregate(
    adapters: &[Box<dyn SourceAdapter>],
    ctx: &RunContext,
) -> Result<Vec<Repository>, AggregateError> {
    let mut out = Vec::new();
    for adapter in adapters {
        let kind = adapter.kind();
        let repos = adapter.list_repositories(ctx).await?;
        info!(source = kind.as_str(), repos = repos.len(), "listed repositories");

        for mut repo in repos {
            let items = match adapter.list_items(&repo).await {
                Ok(items) => items,
                Err(SourceError::NotFound(detail)) => {
                    warn!(repo = %repo.name, %detail, "items not found; skipping repository");
                    continue;
                }
                Err(SourceError::RateLimited(detail)) => {
                    warn!(repo = %repo.name, %detail, "rate limit exceeded while listing items");
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            };

            for item in items {
                if requires_verification(&repo, &item) {
                    repo.add_flagged(&item);
                }
                repo.add(item);
            }

            info!(
                source = kind.as_str(),
                repo = %repo.name,
                items = repo.items.len(),
                flagged = repo.flagged.len(),
                "aggregated repository"
            );
            if !repo.items.is_empty() {
                out.push(repo);
            }
        }
    }
    Ok(out)
}

/// Flagged items of all repositories, in classification order.
pub fn flagged_items(repos: &[Repository]) -> Vec<FlaggedItem> {
    repos
        .iter()
        .flat_map(|repo| repo.flagged.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_timestamp;
    use crate::model::{SourceKind, VerificationSettings};
    use async_trait::async_trait;

    fn item(url: &str, state: &str) -> ReviewableItem {
        let ts = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        ReviewableItem {
            source_kind: SourceKind::Github,
            url: url.into(),
            title: "t".into(),
            owner: "o".into(),
            state: state.into(),
            created_at: ts,
            latest_activity_at: ts,
            required_review_count: 1,
            reviews: Vec::new(),
            source_branch: None,
        }
    }

    struct Fixed {
        repos: Vec<(Repository, Result<Vec<ReviewableItem>, &'static str>)>,
    }

    #[async_trait]
    impl SourceAdapter for Fixed {
        fn kind(&self) -> SourceKind {
            SourceKind::Github
        }
        async fn list_repositories(&self, _ctx: &RunContext) -> Result<Vec<Repository>, SourceError> {
            Ok(self.repos.iter().map(|(r, _)| r.clone()).collect())
        }
        async fn list_items(&self, repo: &Repository) -> Result<Vec<ReviewableItem>, SourceError> {
            let (_, items) = self.repos.iter().find(|(r, _)| r.name == repo.name).unwrap();
            match items {
                Ok(items) => Ok(items.clone()),
                Err(kind) if *kind == "timeout" => Err(SourceError::Timeout("slow".into())),
                Err(_) => Err(SourceError::RateLimited("limit".into())),
            }
        }
    }

    fn repo(name: &str, verify: bool) -> Repository {
        Repository::new(SourceKind::Github, name, name, format!("https://github.com/{}", name))
            .with_verification(VerificationSettings {
                enabled: verify,
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn drops_empty_repositories_and_flags_open_items() {
        let adapter: Box<dyn SourceAdapter> = Box::new(Fixed {
            repos: vec![
                (repo("org/empty", true), Ok(vec![])),
                (
                    repo("org/busy", true),
                    Ok(vec![item("https://x/pull/1", "open"), item("https://x/pull/2", "closed")]),
                ),
                (repo("org/limited", true), Err("rate")),
                (repo("org/quiet", false), Ok(vec![item("https://x/pull/3", "open")])),
            ],
        });
        let repos = aggregate(&[adapter], &RunContext::capture()).await.unwrap();
        let names: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["org/busy", "org/quiet"]);

        let flagged = flagged_items(&repos);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, "org-busy-1");
        assert_eq!(flagged[0].repository, "org/busy");
    }

    #[tokio::test]
    async fn timeouts_abort_the_pass_as_transient() {
        let adapter: Box<dyn SourceAdapter> = Box::new(Fixed {
            repos: vec![(repo("org/a", false), Err("timeout"))],
        });
        let err = aggregate(&[adapter], &RunContext::capture()).await.unwrap_err();
        assert!(matches!(err, AggregateError::TransientNetwork(_)));
    }

    #[test]
    fn state_must_match_exactly() {
        let r = repo("org/a", true);
        assert!(requires_verification(&r, &item("u/1", "open")));
        assert!(!requires_verification(&r, &item("u/1", "Open")));
    }
}
