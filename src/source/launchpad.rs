use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use indexmap::IndexMap;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::github::transport_error;
use super::{next_page, or_partial, resolve_or_recover, Resolved, SourceAdapter, SourceError};
use crate::clock::{de_timestamp, RunContext, Timestamp};
use crate::config::{LaunchpadSources, LpGitSources, OwnerSettings, RepoSettings};
use crate::model::{
    summarize_description, BranchRef, Repository, Review, ReviewableItem, SourceKind,
    EMPTY_RESULT,
};

const LAUNCHPAD_API_BASE: &str = "https://api.launchpad.net/devel/";
const LAUNCHPAD_WEB_BASE: &str = "https://code.launchpad.net/";
const NEEDS_REVIEW: &str = "Needs review";
const WORK_IN_PROGRESS: &str = "Work in progress";
const REQUIRED_REVIEWS: u32 = 2;

/// A git repository or branch that merge proposals target.
#[derive(Debug, Clone, Deserialize)]
pub struct LpTarget {
    pub self_link: String,
    pub web_link: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LpMergeProposal {
    pub self_link: String,
    pub web_link: String,
    pub queue_status: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub date_created: Timestamp,
    #[serde(default)]
    pub description: Option<String>,
    pub registrant_link: String,
    #[serde(default)]
    pub source_git_path: Option<String>,
    #[serde(default)]
    pub source_git_repository_link: Option<String>,
    #[serde(default)]
    pub target_git_path: Option<String>,
    #[serde(default)]
    pub target_git_repository_link: Option<String>,
    #[serde(default)]
    pub source_branch_link: Option<String>,
    #[serde(default)]
    pub target_branch_link: Option<String>,
    pub votes_collection_link: String,
    pub all_comments_collection_link: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LpVote {
    pub self_link: String,
    #[serde(default)]
    pub web_link: Option<String>,
    pub reviewer_link: String,
    #[serde(default)]
    pub comment_link: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub date_created: Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LpComment {
    #[serde(default)]
    pub vote: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub date_created: Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LpPerson {
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct LpCollection<T> {
    #[serde(default = "Vec::new")]
    entries: Vec<T>,
    #[serde(default)]
    next_collection_link: Option<String>,
}

/// Read access to the Launchpad web service used by [`LaunchpadSource`].
#[async_trait]
pub trait LaunchpadApi: Send + Sync {
    async fn git_repository(&self, path: &str) -> Result<LpTarget, SourceError>;
    async fn branch(&self, url: &str) -> Result<LpTarget, SourceError>;
    async fn owner_branches(
        &self,
        owner: &str,
        modified_since: Timestamp,
    ) -> Result<Vec<LpTarget>, SourceError>;
    /// Merge proposals in `status`; `Unsupported` when the target cannot be
    /// queried per state.
    async fn merge_proposals(
        &self,
        target_link: &str,
        status: &str,
    ) -> Result<Vec<LpMergeProposal>, SourceError>;
    async fn landing_candidates(&self, target_link: &str)
        -> Result<Vec<LpMergeProposal>, SourceError>;
    async fn votes(&self, link: &str) -> Result<Vec<LpVote>, SourceError>;
    async fn comments(&self, link: &str) -> Result<Vec<LpComment>, SourceError>;
    async fn comment(&self, link: &str) -> Result<LpComment, SourceError>;
    async fn person(&self, link: &str) -> Result<LpPerson, SourceError>;
}

/// Tokens from a launchpadlib credentials store file.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchpadCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

impl fmt::Debug for LaunchpadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchpadCredentials")
            .field("consumer_key", &self.consumer_key)
            .finish_non_exhaustive()
    }
}

impl LaunchpadCredentials {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials store {}", path.display()))?;
        Self::parse(&content)
            .ok_or_else(|| anyhow!("incomplete launchpad credentials in {}", path.display()))
    }

    /// Parse the `key = value` lines of a credentials file.
    pub fn parse(content: &str) -> Option<Self> {
        let mut values: IndexMap<&str, &str> = IndexMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('[') || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim(), value.trim());
            }
        }
        Some(Self {
            consumer_key: values.get("consumer_key")?.to_string(),
            consumer_secret: values.get("consumer_secret").copied().unwrap_or("").to_string(),
            access_token: values.get("access_token")?.to_string(),
            access_secret: values.get("access_secret")?.to_string(),
        })
    }

    /// OAuth 1.0 PLAINTEXT `Authorization` header value.
    pub fn authorization_header(&self, timestamp: i64, nonce: &str) -> String {
        format!(
            "OAuth realm=\"https://api.launchpad.net/\", oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature_method=\"PLAINTEXT\", oauth_signature=\"{}&{}\", oauth_timestamp=\"{}\", oauth_nonce=\"{}\", oauth_version=\"1.0\"",
            self.consumer_key,
            self.access_token,
            self.consumer_secret,
            self.access_secret,
            timestamp,
            nonce
        )
    }
}

#[derive(Clone)]
pub struct LaunchpadClient {
    http: Client,
    base_url: Url,
    credentials: Option<LaunchpadCredentials>,
}

impl fmt::Debug for LaunchpadClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchpadClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl LaunchpadClient {
    pub fn new(credentials: Option<LaunchpadCredentials>) -> Result<Self, SourceError> {
        let base_url = Url::parse(LAUNCHPAD_API_BASE).expect("valid default Launchpad URL");
        Self::with_base_url(credentials, base_url)
    }

    pub fn with_base_url(
        credentials: Option<LaunchpadCredentials>,
        base_url: Url,
    ) -> Result<Self, SourceError> {
        let http = Client::builder()
            .user_agent("review-gator/0.1")
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    pub fn build_get(&self, url: Url) -> Result<reqwest::Request, SourceError> {
        let mut builder = self.http.get(url).header("Accept", "application/json");
        if let Some(creds) = &self.credentials {
            let nonce = Uuid::new_v4().simple().to_string();
            let now = chrono::Utc::now().timestamp();
            builder = builder.header("Authorization", creds.authorization_header(now, &nonce));
        }
        Ok(builder.build()?)
    }

    fn parse_link(link: &str) -> Result<Url, SourceError> {
        Url::parse(link).map_err(|e| SourceError::Decode(format!("invalid link {}: {}", link, e)))
    }

    fn ws_op(&self, path: &str, op: &str, args: &[(&str, &str)]) -> Result<Url, SourceError> {
        let mut url = if path.starts_with("http") {
            Self::parse_link(path)?
        } else {
            self.base_url
                .join(path)
                .map_err(|e| SourceError::Decode(format!("invalid path {}: {}", path, e)))?
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("ws.op", op);
            for (k, v) in args {
                query.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let request = self.build_get(url)?;
        debug!(url = %request.url(), "launchpad request");
        let res = self.http.execute(request).await.map_err(transport_error)?;
        let status = res.status();
        if !status.is_success() {
            let url = res.url().to_string();
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, url, body));
        }
        res.json::<T>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    /// Fetch every page of a collection, following `next_collection_link`.
    async fn get_collection<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, SourceError> {
        let mut out = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let context = url.to_string();
            let page: LpCollection<T> = match next_page(&context, out.len(), self.get_json(url).await)? {
                Some(page) => page,
                None => break,
            };
            out.extend(page.entries);
            if let Some(link) = page.next_collection_link {
                next = Some(Self::parse_link(&link)?);
            }
        }
        Ok(out)
    }

    async fn lookup(&self, url: Url, reference: &str) -> Result<LpTarget, SourceError> {
        let found: Option<LpTarget> = self.get_json(url).await?;
        found.ok_or_else(|| SourceError::NotFound(reference.to_string()))
    }
}

#[async_trait]
impl LaunchpadApi for LaunchpadClient {
    async fn git_repository(&self, path: &str) -> Result<LpTarget, SourceError> {
        let url = self.ws_op("git_repositories", "getByPath", &[("path", path)])?;
        self.lookup(url, path).await
    }

    async fn branch(&self, url: &str) -> Result<LpTarget, SourceError> {
        let endpoint = self.ws_op("branches", "getByUrl", &[("url", url)])?;
        self.lookup(endpoint, url).await
    }

    async fn owner_branches(
        &self,
        owner: &str,
        modified_since: Timestamp,
    ) -> Result<Vec<LpTarget>, SourceError> {
        let since = modified_since.to_rfc3339();
        let url = self.ws_op(
            &format!("~{}", owner),
            "getBranches",
            &[("modified_since", since.as_str())],
        )?;
        self.get_collection(url).await
    }

    async fn merge_proposals(
        &self,
        target_link: &str,
        status: &str,
    ) -> Result<Vec<LpMergeProposal>, SourceError> {
        let url = self.ws_op(target_link, "getMergeProposals", &[("status", status)])?;
        match self.get_collection(url).await {
            Err(SourceError::Status { status: 400, body, .. }) => Err(SourceError::Unsupported(body)),
            other => other,
        }
    }

    async fn landing_candidates(
        &self,
        target_link: &str,
    ) -> Result<Vec<LpMergeProposal>, SourceError> {
        let url = Self::parse_link(&format!(
            "{}/landing_candidates",
            target_link.trim_end_matches('/')
        ))?;
        self.get_collection(url).await
    }

    async fn votes(&self, link: &str) -> Result<Vec<LpVote>, SourceError> {
        self.get_collection(Self::parse_link(link)?).await
    }

    async fn comments(&self, link: &str) -> Result<Vec<LpComment>, SourceError> {
        self.get_collection(Self::parse_link(link)?).await
    }

    async fn comment(&self, link: &str) -> Result<LpComment, SourceError> {
        self.get_json(Self::parse_link(link)?).await
    }

    async fn person(&self, link: &str) -> Result<LpPerson, SourceError> {
        self.get_json(Self::parse_link(link)?).await
    }
}

fn classify_status(status: StatusCode, url: String, body: String) -> SourceError {
    match status {
        StatusCode::NOT_FOUND => SourceError::NotFound(url),
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited(body),
        _ => SourceError::Status {
            status: status.as_u16(),
            url,
            body,
        },
    }
}

fn strip_api_prefix(link: &str) -> &str {
    link.strip_prefix(LAUNCHPAD_API_BASE).unwrap_or(link)
}

/// `refs/heads/feature` -> `feature`.
pub fn format_git_branch_name(path: &str) -> &str {
    path.strip_prefix("refs/heads/").unwrap_or(path)
}

fn endpoint_label(
    repository_link: Option<&str>,
    git_path: Option<&str>,
    branch_link: Option<&str>,
) -> String {
    match (repository_link, git_path) {
        (Some(repo), Some(path)) => {
            format!("{}:{}", strip_api_prefix(repo), format_git_branch_name(path))
        }
        _ => branch_link.map(strip_api_prefix).unwrap_or_default().to_string(),
    }
}

/// `source ⇒ target`, plus the summarized first description line.
pub fn merge_proposal_title(mp: &LpMergeProposal) -> String {
    let source = endpoint_label(
        mp.source_git_repository_link.as_deref(),
        mp.source_git_path.as_deref(),
        mp.source_branch_link.as_deref(),
    );
    let target = endpoint_label(
        mp.target_git_repository_link.as_deref(),
        mp.target_git_path.as_deref(),
        mp.target_branch_link.as_deref(),
    );
    let mut title = format!("{} \u{21d2} {}", source, target);
    if let Some(description) = &mp.description {
        title.push('\n');
        title.push_str(&summarize_description(description));
    }
    title
}

fn name_from_link(link: &str) -> &str {
    link.rsplit_once('~').map(|(_, name)| name).unwrap_or(link)
}

/// Which Launchpad objects a source instance reads.
pub enum LaunchpadTargets {
    GitRepositories(IndexMap<String, RepoSettings>),
    Branches {
        branches: IndexMap<String, RepoSettings>,
        owners: IndexMap<String, OwnerSettings>,
    },
}

/// Launchpad merge proposals as reviewable items.
pub struct LaunchpadSource<A> {
    api: A,
    targets: LaunchpadTargets,
}

impl<A: LaunchpadApi> LaunchpadSource<A> {
    pub fn git(api: A, sources: LpGitSources) -> Self {
        Self {
            api,
            targets: LaunchpadTargets::GitRepositories(sources.repos),
        }
    }

    pub fn branches(api: A, sources: LaunchpadSources) -> Self {
        Self {
            api,
            targets: LaunchpadTargets::Branches {
                branches: sources.branches,
                owners: sources.owners,
            },
        }
    }

    async fn resolve_configured(
        &self,
        entries: &IndexMap<String, RepoSettings>,
        git: bool,
    ) -> Result<Vec<Repository>, SourceError> {
        let mut repos = Vec::new();
        for (reference, settings) in entries {
            let path = reference.trim_start_matches("lp:");
            let lookup = if git {
                self.api.git_repository(path).await
            } else {
                self.api.branch(reference).await
            };
            let repo = match resolve_or_recover(reference, lookup)? {
                Resolved::Found(target) => {
                    Repository::new(SourceKind::Launchpad, target.self_link, target.display_name, target.web_link)
                }
                Resolved::RateLimited => Repository::new(
                    SourceKind::Launchpad,
                    format!("{}{}", LAUNCHPAD_API_BASE, path),
                    path,
                    format!("{}{}", LAUNCHPAD_WEB_BASE, path),
                ),
                Resolved::Skip => continue,
            };
            info!(repo = %repo.name, "resolved launchpad target");
            repos.push(
                repo.with_tab_name(settings.tab_name())
                    .with_verification(settings.verification()),
            );
        }
        Ok(repos)
    }

    /// Recently modified branches of each owner not already collected.
    async fn discover_owner_branches(
        &self,
        owners: &IndexMap<String, OwnerSettings>,
        collected: &[String],
        ctx: &RunContext,
    ) -> Result<Vec<Repository>, SourceError> {
        let mut repos = Vec::new();
        for (owner, settings) in owners {
            let since: Timestamp = (ctx.now - ChronoDuration::days(i64::from(settings.max_age))).into();
            let branches = match resolve_or_recover(owner, self.api.owner_branches(owner, since).await)? {
                Resolved::Found(branches) => branches,
                Resolved::RateLimited | Resolved::Skip => continue,
            };
            for b in branches {
                if collected.contains(&b.display_name) {
                    continue;
                }
                repos.push(Repository::new(
                    SourceKind::Launchpad,
                    b.self_link,
                    b.display_name,
                    b.web_link,
                ));
            }
        }
        Ok(repos)
    }

    /// Items awaiting review or in progress, or every landing candidate when
    /// the target cannot be queried per state.
    async fn candidates(&self, target_link: &str) -> Result<Vec<LpMergeProposal>, SourceError> {
        let mut out = Vec::new();
        for status in [NEEDS_REVIEW, WORK_IN_PROGRESS] {
            match self.api.merge_proposals(target_link, status).await {
                Ok(mps) => out.extend(mps),
                Err(SourceError::Unsupported(detail)) => {
                    debug!(link = %target_link, %detail, "per-state query unsupported; using landing candidates");
                    return or_partial(target_link, self.api.landing_candidates(target_link).await);
                }
                Err(SourceError::RateLimited(detail)) => {
                    warn!(
                        link = %target_link,
                        status,
                        %detail,
                        "rate limit exceeded while listing merge proposals; keeping those already fetched"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    async fn reviewer_name(&self, link: &str) -> Result<String, SourceError> {
        match self.api.person(link).await {
            Ok(person) => Ok(person.display_name),
            Err(SourceError::NotFound(_)) => Ok(name_from_link(link).to_string()),
            Err(SourceError::RateLimited(detail)) => {
                warn!(reviewer = %link, %detail, "rate limit exceeded while resolving reviewer; using link name");
                Ok(name_from_link(link).to_string())
            }
            Err(err) => Err(err),
        }
    }

    async fn build_item(&self, mp: LpMergeProposal) -> Result<ReviewableItem, SourceError> {
        let title = merge_proposal_title(&mp);
        let source_branch = match (&mp.source_git_repository_link, &mp.source_git_path) {
            (Some(repo), Some(path)) => Some(BranchRef {
                repository: format!("lp:{}", strip_api_prefix(repo)),
                branch: format_git_branch_name(path).to_string(),
            }),
            _ => None,
        };

        let comments = or_partial(&mp.web_link, self.api.comments(&mp.all_comments_collection_link).await)?;
        let votes = or_partial(&mp.web_link, self.api.votes(&mp.votes_collection_link).await)?;

        let mut item = ReviewableItem {
            source_kind: SourceKind::Launchpad,
            url: mp.web_link.clone(),
            title,
            owner: name_from_link(&mp.registrant_link).to_string(),
            state: mp.queue_status.clone(),
            created_at: mp.date_created,
            latest_activity_at: mp.date_created,
            required_review_count: REQUIRED_REVIEWS,
            reviews: Vec::new(),
            source_branch,
        };

        for vote in votes {
            let owner = self.reviewer_name(&vote.reviewer_link).await?;
            let (result, submitted_at) = match &vote.comment_link {
                None => (EMPTY_RESULT.to_string(), vote.date_created),
                Some(link) => match self.api.comment(link).await {
                    Ok(comment) => (
                        comment.vote.unwrap_or_else(|| EMPTY_RESULT.to_string()),
                        comment.date_created,
                    ),
                    Err(SourceError::NotFound(_)) => {
                        warn!(
                            item = %mp.web_link,
                            reviewer = %owner,
                            "could not find comment for vote; comment was likely deleted"
                        );
                        (EMPTY_RESULT.to_string(), vote.date_created)
                    }
                    Err(SourceError::RateLimited(detail)) => {
                        warn!(
                            item = %mp.web_link,
                            reviewer = %owner,
                            %detail,
                            "rate limit exceeded while fetching vote comment; result may be incomplete"
                        );
                        (EMPTY_RESULT.to_string(), vote.date_created)
                    }
                    Err(err) => return Err(err),
                },
            };
            item.add_review(Review {
                source_kind: SourceKind::Launchpad,
                url: vote.web_link.unwrap_or_else(|| mp.web_link.clone()),
                reviewer: vote.self_link,
                owner,
                result,
                submitted_at,
            });
        }

        let comment_times: Vec<Timestamp> = comments.iter().map(|c| c.date_created).collect();
        item.latest_activity_at =
            self.compute_latest_activity(item.created_at, &comment_times, &[], &item.reviews);
        Ok(item)
    }
}

#[async_trait]
impl<A: LaunchpadApi> SourceAdapter for LaunchpadSource<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::Launchpad
    }

    async fn list_repositories(&self, ctx: &RunContext) -> Result<Vec<Repository>, SourceError> {
        match &self.targets {
            LaunchpadTargets::GitRepositories(repos) => self.resolve_configured(repos, true).await,
            LaunchpadTargets::Branches { branches, owners } => {
                let mut repos = self.resolve_configured(branches, false).await?;
                let collected: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
                debug!(?collected, "collected launchpad branches");
                repos.extend(self.discover_owner_branches(owners, &collected, ctx).await?);
                Ok(repos)
            }
        }
    }

    async fn list_items(&self, repo: &Repository) -> Result<Vec<ReviewableItem>, SourceError> {
        let mps = self.candidates(&repo.handle).await?;
        let mut items = Vec::with_capacity(mps.len());
        for mp in mps {
            items.push(self.build_item(mp).await?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_timestamp;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ts(s: &str) -> Timestamp {
        parse_timestamp(s).unwrap()
    }

    fn mp(id: u32, status: &str, description: Option<&str>) -> LpMergeProposal {
        LpMergeProposal {
            self_link: format!("{}~dev/proj/+git/proj/+merge/{}", LAUNCHPAD_API_BASE, id),
            web_link: format!("https://code.launchpad.net/~dev/proj/+git/proj/+merge/{}", id),
            queue_status: status.into(),
            date_created: ts("2024-01-01T00:00:00Z"),
            description: description.map(str::to_string),
            registrant_link: format!("{}~dev", LAUNCHPAD_API_BASE),
            source_git_path: Some("refs/heads/fix".into()),
            source_git_repository_link: Some(format!("{}~dev/proj/+git/proj", LAUNCHPAD_API_BASE)),
            target_git_path: Some("refs/heads/main".into()),
            target_git_repository_link: Some(format!("{}proj", LAUNCHPAD_API_BASE)),
            source_branch_link: None,
            target_branch_link: None,
            votes_collection_link: format!("votes/{}", id),
            all_comments_collection_link: format!("comments/{}", id),
        }
    }

    #[derive(Default)]
    struct FakeLaunchpad {
        targets: HashMap<String, LpTarget>,
        per_state: Option<HashMap<String, Vec<LpMergeProposal>>>,
        landing: Vec<LpMergeProposal>,
        votes: HashMap<String, Vec<LpVote>>,
        comments: HashMap<String, LpComment>,
        owner_branches: Vec<LpTarget>,
        since: Mutex<Option<Timestamp>>,
        /// States, comment links and person links that answer 429.
        throttled: Vec<String>,
    }

    impl FakeLaunchpad {
        fn check(&self, key: &str) -> Result<(), SourceError> {
            if self.throttled.iter().any(|t| t == key) {
                return Err(SourceError::RateLimited(key.into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LaunchpadApi for FakeLaunchpad {
        async fn git_repository(&self, path: &str) -> Result<LpTarget, SourceError> {
            self.targets
                .get(path)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(path.into()))
        }
        async fn branch(&self, url: &str) -> Result<LpTarget, SourceError> {
            self.git_repository(url).await
        }
        async fn owner_branches(&self, _o: &str, since: Timestamp) -> Result<Vec<LpTarget>, SourceError> {
            *self.since.lock().unwrap() = Some(since);
            Ok(self.owner_branches.clone())
        }
        async fn merge_proposals(&self, _t: &str, status: &str) -> Result<Vec<LpMergeProposal>, SourceError> {
            self.check(status)?;
            match &self.per_state {
                Some(map) => Ok(map.get(status).cloned().unwrap_or_default()),
                None => Err(SourceError::Unsupported("no getMergeProposals".into())),
            }
        }
        async fn landing_candidates(&self, _t: &str) -> Result<Vec<LpMergeProposal>, SourceError> {
            Ok(self.landing.clone())
        }
        async fn votes(&self, link: &str) -> Result<Vec<LpVote>, SourceError> {
            Ok(self.votes.get(link).cloned().unwrap_or_default())
        }
        async fn comments(&self, _link: &str) -> Result<Vec<LpComment>, SourceError> {
            Ok(vec![LpComment {
                vote: None,
                date_created: ts("2024-01-02T00:00:00Z"),
            }])
        }
        async fn comment(&self, link: &str) -> Result<LpComment, SourceError> {
            self.check(link)?;
            self.comments
                .get(link)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(link.into()))
        }
        async fn person(&self, link: &str) -> Result<LpPerson, SourceError> {
            self.check(link)?;
            let name = name_from_link(link).to_string();
            Ok(LpPerson {
                display_name: name.to_uppercase(),
                name,
            })
        }
    }

    fn target(name: &str) -> LpTarget {
        LpTarget {
            self_link: format!("{}{}", LAUNCHPAD_API_BASE, name),
            web_link: format!("{}{}", LAUNCHPAD_WEB_BASE, name),
            display_name: name.into(),
        }
    }

    #[test]
    fn title_joins_branches_and_truncates_description() {
        let long = format!("{}\nmore", "d".repeat(90));
        let title = merge_proposal_title(&mp(1, NEEDS_REVIEW, Some(&long)));
        let mut lines = title.lines();
        assert_eq!(lines.next(), Some("~dev/proj/+git/proj:fix \u{21d2} proj:main"));
        assert_eq!(lines.next(), Some(format!("{}...", "d".repeat(80)).as_str()));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn credentials_parse_and_sign() {
        let creds = LaunchpadCredentials::parse(
            "[1]\nconsumer_key = review-gator\nconsumer_secret = \naccess_token = tok\naccess_secret = sec\n",
        )
        .unwrap();
        assert_eq!(creds.access_token, "tok");
        let header = creds.authorization_header(1700000000, "abc");
        assert!(header.starts_with("OAuth realm="));
        assert!(header.contains("oauth_signature=\"&sec\""));
        assert!(header.contains("oauth_nonce=\"abc\""));
        assert!(LaunchpadCredentials::parse("consumer_key = x").is_none());
    }

    #[tokio::test]
    async fn falls_back_to_landing_candidates() {
        let fake = FakeLaunchpad {
            landing: vec![mp(1, "Merged", None), mp(2, NEEDS_REVIEW, None)],
            ..Default::default()
        };
        let source = LaunchpadSource::git(fake, LpGitSources::default());
        let repo = Repository::new(SourceKind::Launchpad, "link", "proj", "web");
        let items = source.list_items(&repo).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn unions_needs_review_and_work_in_progress() {
        let mut per_state = HashMap::new();
        per_state.insert(NEEDS_REVIEW.to_string(), vec![mp(1, NEEDS_REVIEW, None)]);
        per_state.insert(WORK_IN_PROGRESS.to_string(), vec![mp(2, WORK_IN_PROGRESS, None)]);
        let fake = FakeLaunchpad {
            per_state: Some(per_state),
            landing: vec![mp(3, "Merged", None)],
            ..Default::default()
        };
        let source = LaunchpadSource::git(fake, LpGitSources::default());
        let repo = Repository::new(SourceKind::Launchpad, "link", "proj", "web");
        let items = source.list_items(&repo).await.unwrap();
        let states: Vec<&str> = items.iter().map(|i| i.state.as_str()).collect();
        assert_eq!(states, vec![NEEDS_REVIEW, WORK_IN_PROGRESS]);
        assert_eq!(items[0].owner, "dev");
        assert_eq!(items[0].required_review_count, 2);
        assert_eq!(
            items[0].source_branch,
            Some(BranchRef {
                repository: "lp:~dev/proj/+git/proj".into(),
                branch: "fix".into(),
            })
        );
    }

    #[tokio::test]
    async fn missing_vote_comment_yields_empty_result() {
        let mut votes = HashMap::new();
        votes.insert(
            "votes/1".to_string(),
            vec![
                LpVote {
                    self_link: "vote-a".into(),
                    web_link: None,
                    reviewer_link: format!("{}~alice", LAUNCHPAD_API_BASE),
                    comment_link: Some("comment/deleted".into()),
                    date_created: ts("2024-01-03T00:00:00Z"),
                },
                LpVote {
                    self_link: "vote-b".into(),
                    web_link: None,
                    reviewer_link: format!("{}~bob", LAUNCHPAD_API_BASE),
                    comment_link: Some("comment/ok".into()),
                    date_created: ts("2024-01-02T00:00:00Z"),
                },
            ],
        );
        let mut comments = HashMap::new();
        comments.insert(
            "comment/ok".to_string(),
            LpComment {
                vote: Some("Approve".into()),
                date_created: ts("2024-01-04T00:00:00Z"),
            },
        );
        let fake = FakeLaunchpad {
            landing: vec![mp(1, NEEDS_REVIEW, None)],
            votes,
            comments,
            ..Default::default()
        };
        let source = LaunchpadSource::git(fake, LpGitSources::default());
        let repo = Repository::new(SourceKind::Launchpad, "link", "proj", "web");
        let items = source.list_items(&repo).await.unwrap();
        let reviews = &items[0].reviews;
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].owner, "ALICE");
        assert_eq!(reviews[0].result, EMPTY_RESULT);
        assert_eq!(reviews[0].submitted_at, ts("2024-01-03T00:00:00Z"));
        assert_eq!(reviews[1].result, "Approve");
        assert_eq!(items[0].latest_activity_at, ts("2024-01-04T00:00:00Z"));
    }

    #[tokio::test]
    async fn skips_unknown_repositories_and_discovers_owner_branches() {
        let mut targets = HashMap::new();
        targets.insert("lp:~team/proj/trunk".to_string(), target("~team/proj/trunk"));
        let mut owners = IndexMap::new();
        owners.insert("team".to_string(), OwnerSettings { max_age: 7 });
        let mut branches = IndexMap::new();
        branches.insert("lp:~team/proj/trunk".to_string(), RepoSettings::default());
        branches.insert("lp:~team/proj/gone".to_string(), RepoSettings::default());

        let fake = FakeLaunchpad {
            targets,
            owner_branches: vec![target("~team/proj/trunk"), target("~team/proj/new")],
            ..Default::default()
        };
        let source = LaunchpadSource::branches(fake, LaunchpadSources { branches, owners });
        let ctx = RunContext::at(ts("2024-01-10T00:00:00Z").into());
        let repos = source.list_repositories(&ctx).await.unwrap();
        let names: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["~team/proj/trunk", "~team/proj/new"]);
        assert_eq!(
            *source.api.since.lock().unwrap(),
            Some(ts("2024-01-03T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn rate_limited_state_query_keeps_fetched_proposals() {
        let mut per_state = HashMap::new();
        per_state.insert(NEEDS_REVIEW.to_string(), vec![mp(1, NEEDS_REVIEW, None), mp(2, NEEDS_REVIEW, None)]);
        per_state.insert(WORK_IN_PROGRESS.to_string(), vec![mp(3, WORK_IN_PROGRESS, None)]);
        let fake = FakeLaunchpad {
            per_state: Some(per_state),
            throttled: vec![WORK_IN_PROGRESS.to_string()],
            ..Default::default()
        };
        let source = LaunchpadSource::git(fake, LpGitSources::default());
        let repo = Repository::new(SourceKind::Launchpad, "link", "proj", "web");
        let items = source.list_items(&repo).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn rate_limited_vote_lookups_fall_back_per_vote() {
        let alice = format!("{}~alice", LAUNCHPAD_API_BASE);
        let mut votes = HashMap::new();
        votes.insert(
            "votes/1".to_string(),
            vec![
                LpVote {
                    self_link: "vote-a".into(),
                    web_link: None,
                    reviewer_link: alice.clone(),
                    comment_link: Some("comment/busy".into()),
                    date_created: ts("2024-01-03T00:00:00Z"),
                },
                LpVote {
                    self_link: "vote-b".into(),
                    web_link: None,
                    reviewer_link: format!("{}~bob", LAUNCHPAD_API_BASE),
                    comment_link: Some("comment/ok".into()),
                    date_created: ts("2024-01-02T00:00:00Z"),
                },
            ],
        );
        let mut comments = HashMap::new();
        comments.insert(
            "comment/ok".to_string(),
            LpComment {
                vote: Some("Approve".into()),
                date_created: ts("2024-01-04T00:00:00Z"),
            },
        );
        let fake = FakeLaunchpad {
            landing: vec![mp(1, NEEDS_REVIEW, None), mp(2, NEEDS_REVIEW, None)],
            votes,
            comments,
            throttled: vec!["comment/busy".to_string(), alice],
            ..Default::default()
        };
        let source = LaunchpadSource::git(fake, LpGitSources::default());
        let repo = Repository::new(SourceKind::Launchpad, "link", "proj", "web");
        let items = source.list_items(&repo).await.unwrap();
        assert_eq!(items.len(), 2);
        let reviews = &items[0].reviews;
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].owner, "alice");
        assert_eq!(reviews[0].result, EMPTY_RESULT);
        assert_eq!(reviews[0].submitted_at, ts("2024-01-03T00:00:00Z"));
        assert_eq!(reviews[1].owner, "BOB");
        assert_eq!(reviews[1].result, "Approve");
    }
}
