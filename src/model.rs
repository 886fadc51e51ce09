use crate::clock::{RunContext, Timestamp};
use crate::ledger;
use serde::{Deserialize, Serialize};

/// Longest description line kept in an item title before it is cut.
pub const MAX_DESCRIPTION_LENGTH: usize = 80;

/// Review result used when a vote has no backing comment.
pub const EMPTY_RESULT: &str = "EMPTY";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Github,
    Launchpad,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Github => "github",
            SourceKind::Launchpad => "launchpad",
        }
    }

    /// Item state that marks an item as awaiting review on this source.
    pub fn needs_review_state(&self) -> &'static str {
        match self {
            SourceKind::Github => "open",
            SourceKind::Launchpad => "Needs review",
        }
    }
}

/// Per-repository verification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSettings {
    pub enabled: bool,
    pub parallel: bool,
    pub environment: Option<String>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            parallel: true,
            environment: None,
        }
    }
}

/// Repository and branch a verification job checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchRef {
    pub repository: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub source_kind: SourceKind,
    /// Opaque upstream reference to the review or vote.
    pub reviewer: String,
    pub url: String,
    pub owner: String,
    pub result: String,
    pub submitted_at: Timestamp,
}

impl Review {
    pub fn age(&self, ctx: &RunContext) -> String {
        ctx.age(&self.submitted_at)
    }
}

/// A pull request or merge proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewableItem {
    pub source_kind: SourceKind,
    pub url: String,
    pub title: String,
    pub owner: String,
    pub state: String,
    pub created_at: Timestamp,
    pub latest_activity_at: Timestamp,
    pub required_review_count: u32,
    pub reviews: Vec<Review>,
    pub source_branch: Option<BranchRef>,
}

impl ReviewableItem {
    /// Last path segment of the item URL.
    pub fn id(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    pub fn age(&self, ctx: &RunContext) -> String {
        ctx.age(&self.created_at)
    }

    pub fn latest_activity_age(&self, ctx: &RunContext) -> String {
        ctx.age(&self.latest_activity_at)
    }

    pub fn add_review(&mut self, review: Review) {
        let reviews = std::mem::take(&mut self.reviews);
        self.reviews = ledger::add_review(reviews, review);
    }
}

/// An item selected for a verification run, with everything the job needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggedItem {
    /// Artifact key, see [`Repository::artifact_key`].
    pub id: String,
    pub url: String,
    pub repository: String,
    pub source: Option<BranchRef>,
    pub environment: Option<String>,
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub source_kind: SourceKind,
    /// Opaque upstream reference (API link or `owner/name`).
    pub handle: String,
    pub name: String,
    pub url: String,
    pub tab_name: Option<String>,
    pub verification: VerificationSettings,
    pub items: Vec<ReviewableItem>,
    pub flagged: Vec<FlaggedItem>,
}

impl Repository {
    pub fn new(
        source_kind: SourceKind,
        handle: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_kind,
            handle: handle.into(),
            name: name.into(),
            url: url.into(),
            tab_name: None,
            verification: VerificationSettings::default(),
            items: Vec::new(),
            flagged: Vec::new(),
        }
    }

    pub fn with_tab_name(mut self, tab_name: Option<String>) -> Self {
        self.tab_name = tab_name;
        self
    }

    pub fn with_verification(mut self, verification: VerificationSettings) -> Self {
        self.verification = verification;
        self
    }

    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn add(&mut self, item: ReviewableItem) {
        self.items.push(item);
    }

    /// File-name key of `item`'s status artifacts. Launchpad merge ids are
    /// global; GitHub pull numbers are only unique within a repository, so
    /// they are prefixed with `<owner>-<repo>`.
    pub fn artifact_key(&self, item: &ReviewableItem) -> String {
        match self.source_kind {
            SourceKind::Launchpad => item.id().to_string(),
            SourceKind::Github => format!("{}-{}", self.name.replace('/', "-"), item.id()),
        }
    }

    /// Record `item` for verification using this repository's settings.
    pub fn add_flagged(&mut self, item: &ReviewableItem) {
        self.flagged.push(FlaggedItem {
            id: self.artifact_key(item),
            url: item.url.clone(),
            repository: self.name.clone(),
            source: item.source_branch.clone(),
            environment: self.verification.environment.clone(),
            parallel: self.verification.parallel,
        });
    }
}

/// First line of `description`, cut to [`MAX_DESCRIPTION_LENGTH`] characters
/// with a trailing `...` when longer.
pub fn summarize_description(description: &str) -> String {
    let first = description.lines().next().unwrap_or("");
    if first.chars().count() > MAX_DESCRIPTION_LENGTH {
        let cut: String = first.chars().take(MAX_DESCRIPTION_LENGTH).collect();
        format!("{}...", cut)
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_timestamp;

    fn item(url: &str) -> ReviewableItem {
        let ts = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        ReviewableItem {
            source_kind: SourceKind::Launchpad,
            url: url.into(),
            title: "t".into(),
            owner: "o".into(),
            state: "Needs review".into(),
            created_at: ts,
            latest_activity_at: ts,
            required_review_count: 2,
            reviews: Vec::new(),
            source_branch: None,
        }
    }

    #[test]
    fn long_description_is_cut_at_80() {
        let line = "x".repeat(90);
        let out = summarize_description(&format!("{}\nsecond line", line));
        assert_eq!(out, format!("{}...", "x".repeat(80)));
    }

    #[test]
    fn description_of_exactly_80_is_kept() {
        let line = "y".repeat(80);
        assert_eq!(summarize_description(&line), line);
    }

    #[test]
    fn item_id_is_last_url_segment() {
        let it = item("https://code.launchpad.net/~me/proj/+git/proj/+merge/4242");
        assert_eq!(it.id(), "4242");
    }

    #[test]
    fn flagged_item_carries_repository_settings() {
        let mut repo = Repository::new(SourceKind::Launchpad, "h", "~team/proj", "u")
            .with_verification(VerificationSettings {
                enabled: true,
                parallel: false,
                environment: Some("py3".into()),
            });
        let it = item("https://lp/+merge/7");
        repo.add_flagged(&it);
        assert_eq!(repo.short_name(), "proj");
        assert_eq!(repo.flagged.len(), 1);
        assert_eq!(repo.flagged[0].id, "7");
        assert!(!repo.flagged[0].parallel);
        assert_eq!(repo.flagged[0].environment.as_deref(), Some("py3"));
    }

    #[test]
    fn github_artifact_keys_are_scoped_to_the_repository() {
        let mut a = Repository::new(SourceKind::Github, "org/a", "org/a", "https://github.com/org/a");
        let mut b = Repository::new(SourceKind::Github, "org/b", "org/b", "https://github.com/org/b");
        let mut pr_a = item("https://github.com/org/a/pull/1");
        pr_a.source_kind = SourceKind::Github;
        let mut pr_b = item("https://github.com/org/b/pull/1");
        pr_b.source_kind = SourceKind::Github;
        a.add_flagged(&pr_a);
        b.add_flagged(&pr_b);
        assert_eq!(pr_a.id(), pr_b.id());
        assert_eq!(a.flagged[0].id, "org-a-1");
        assert_eq!(b.flagged[0].id, "org-b-1");
    }
}
