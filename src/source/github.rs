use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::{next_page, or_partial, resolve_or_recover, Resolved, SourceAdapter, SourceError};
use crate::clock::{de_opt_timestamp, de_timestamp, RunContext, Timestamp};
use crate::config::{GithubSources, RepoSettings};
use crate::model::{BranchRef, Repository, Review, ReviewableItem, SourceKind};

const GITHUB_API_BASE: &str = "https://api.github.com/";
const GITHUB_WEB_BASE: &str = "https://github.com/";
const PENDING_REVIEW: &str = "PENDING";

static NEXT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<([^>]+)>;\s*rel="next""#).expect("valid link regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct GhUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepo {
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub clone_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhHeadRepo {
    pub clone_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhHead {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub repo: Option<GhHeadRepo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhPull {
    pub number: u64,
    pub html_url: String,
    pub title: String,
    pub user: GhUser,
    pub state: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: Timestamp,
    #[serde(default)]
    pub head: Option<GhHead>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhReview {
    pub id: u64,
    pub html_url: String,
    #[serde(default)]
    pub user: Option<GhUser>,
    pub state: String,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub submitted_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhComment {
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: Timestamp,
}

/// Read access to the GitHub REST API used by [`GithubSource`].
#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn get_repo(&self, full_name: &str) -> Result<GhRepo, SourceError>;
    async fn list_pulls(&self, full_name: &str) -> Result<Vec<GhPull>, SourceError>;
    async fn list_reviews(&self, full_name: &str, number: u64) -> Result<Vec<GhReview>, SourceError>;
    async fn list_review_comments(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<Vec<GhComment>, SourceError>;
    async fn list_issue_comments(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<Vec<GhComment>, SourceError>;
}

#[derive(Clone)]
pub enum GithubAuth {
    Token(String),
    Basic { username: String, password: String },
}

#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    base_url: Url,
    auth: GithubAuth,
}

impl fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn new(auth: GithubAuth) -> Result<Self, SourceError> {
        let base_url = Url::parse(GITHUB_API_BASE).expect("valid default GitHub URL");
        Self::with_base_url(auth, base_url)
    }

    pub fn with_base_url(auth: GithubAuth, base_url: Url) -> Result<Self, SourceError> {
        let http = Client::builder()
            .user_agent("review-gator/0.1")
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth,
        })
    }

    /// Build an authenticated GET request for `url`.
    pub fn build_get(&self, url: Url) -> Result<reqwest::Request, SourceError> {
        let builder = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        let builder = match &self.auth {
            GithubAuth::Token(token) => builder.bearer_auth(token),
            GithubAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
        };
        Ok(builder.build()?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::Decode(format!("invalid GitHub URL {}: {}", path, e)))
    }

    async fn send(&self, url: Url) -> Result<Response, SourceError> {
        let request = self.build_get(url)?;
        debug!(url = %request.url(), "github request");
        let res = self.http.execute(request).await.map_err(transport_error)?;
        check_status(res).await
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let res = self.send(self.endpoint(path)?).await?;
        res.json::<T>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    /// Fetch every page of a list endpoint, following `Link: rel="next"`.
    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, SourceError> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut().append_pair("per_page", "100");
        let mut out = Vec::new();
        loop {
            let res = match next_page(path, out.len(), self.send(url).await)? {
                Some(res) => res,
                None => break,
            };
            let next = next_link(
                res.headers()
                    .get("link")
                    .and_then(|v| v.to_str().ok()),
            );
            let page: Vec<T> = res
                .json()
                .await
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            out.extend(page);
            match next {
                Some(link) => {
                    url = Url::parse(&link)
                        .map_err(|e| SourceError::Decode(format!("invalid next link: {}", e)))?
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn get_repo(&self, full_name: &str) -> Result<GhRepo, SourceError> {
        self.get_one(&format!("repos/{}", full_name)).await
    }

    async fn list_pulls(&self, full_name: &str) -> Result<Vec<GhPull>, SourceError> {
        self.get_all(&format!("repos/{}/pulls", full_name)).await
    }

    async fn list_reviews(&self, full_name: &str, number: u64) -> Result<Vec<GhReview>, SourceError> {
        self.get_all(&format!("repos/{}/pulls/{}/reviews", full_name, number))
            .await
    }

    async fn list_review_comments(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<Vec<GhComment>, SourceError> {
        self.get_all(&format!("repos/{}/pulls/{}/comments", full_name, number))
            .await
    }

    async fn list_issue_comments(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<Vec<GhComment>, SourceError> {
        self.get_all(&format!("repos/{}/issues/{}/comments", full_name, number))
            .await
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout(err.to_string())
    } else {
        SourceError::Http(err)
    }
}

async fn check_status(res: Response) -> Result<Response, SourceError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let url = res.url().to_string();
    let exhausted = res
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let body = res.text().await.unwrap_or_default();
    Err(classify_status(status, exhausted, url, body))
}

/// Map an unsuccessful GitHub response onto the error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    rate_limit_exhausted: bool,
    url: String,
    body: String,
) -> SourceError {
    match status {
        StatusCode::NOT_FOUND => SourceError::NotFound(url),
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited(body),
        StatusCode::FORBIDDEN if rate_limit_exhausted => SourceError::RateLimited(body),
        _ => SourceError::Status {
            status: status.as_u16(),
            url,
            body,
        },
    }
}

pub(crate) fn next_link(header: Option<&str>) -> Option<String> {
    let header = header?;
    NEXT_LINK
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// GitHub pull requests as reviewable items.
pub struct GithubSource<A> {
    api: A,
    sources: GithubSources,
}

impl<A: GithubApi> GithubSource<A> {
    pub fn new(api: A, sources: GithubSources) -> Self {
        Self { api, sources }
    }

    fn configured(&self) -> impl Iterator<Item = (String, &RepoSettings)> + '_ {
        self.sources.repos.iter().flat_map(|(org, entries)| {
            entries
                .iter()
                .map(move |(name, settings)| (format!("{}/{}", org.replace(' ', ""), name), settings))
        })
    }

    fn settings_for(&self, handle: &str) -> Option<&RepoSettings> {
        self.configured()
            .find(|(full_name, _)| full_name == handle)
            .map(|(_, settings)| settings)
    }

    async fn build_item(
        &self,
        full_name: &str,
        pull: GhPull,
        review_count: u32,
    ) -> Result<ReviewableItem, SourceError> {
        let context = format!("{}#{}", full_name, pull.number);
        let raw_reviews = or_partial(&context, self.api.list_reviews(full_name, pull.number).await)?;
        let comments = or_partial(
            &context,
            self.api.list_review_comments(full_name, pull.number).await,
        )?;
        let issue_comments = or_partial(
            &context,
            self.api.list_issue_comments(full_name, pull.number).await,
        )?;

        let source_branch = pull.head.as_ref().and_then(|head| {
            head.repo.as_ref().map(|repo| BranchRef {
                repository: repo.clone_url.clone(),
                branch: head.ref_name.clone(),
            })
        });

        let mut item = ReviewableItem {
            source_kind: SourceKind::Github,
            url: pull.html_url,
            title: pull.title,
            owner: pull.user.login,
            state: pull.state,
            created_at: pull.created_at,
            latest_activity_at: pull.created_at,
            required_review_count: review_count,
            reviews: Vec::new(),
            source_branch,
        };

        for raw in raw_reviews {
            if raw.state == PENDING_REVIEW {
                continue;
            }
            let Some(submitted_at) = raw.submitted_at else {
                continue;
            };
            item.add_review(Review {
                source_kind: SourceKind::Github,
                reviewer: raw.id.to_string(),
                url: raw.html_url,
                owner: raw.user.map(|u| u.login).unwrap_or_else(|| "ghost".into()),
                result: raw.state,
                submitted_at,
            });
        }

        let comment_times: Vec<Timestamp> = comments.iter().map(|c| c.created_at).collect();
        let issue_times: Vec<Timestamp> = issue_comments.iter().map(|c| c.created_at).collect();
        item.latest_activity_at = self.compute_latest_activity(
            item.created_at,
            &comment_times,
            &issue_times,
            &item.reviews,
        );
        Ok(item)
    }
}

#[async_trait]
impl<A: GithubApi> SourceAdapter for GithubSource<A> {
    fn kind(&self) -> SourceKind {
        SourceKind::Github
    }

    async fn list_repositories(&self, _ctx: &RunContext) -> Result<Vec<Repository>, SourceError> {
        let mut repos = Vec::new();
        for (full_name, settings) in self.configured() {
            let resolved = resolve_or_recover(&full_name, self.api.get_repo(&full_name).await)?;
            let url = match resolved {
                Resolved::Found(gh) => gh.html_url,
                Resolved::RateLimited => format!("{}{}", GITHUB_WEB_BASE, full_name),
                Resolved::Skip => continue,
            };
            let repo = Repository::new(SourceKind::Github, full_name.clone(), full_name, url)
                .with_tab_name(settings.tab_name())
                .with_verification(settings.verification());
            info!(repo = %repo.name, "resolved github repository");
            repos.push(repo);
        }
        Ok(repos)
    }

    async fn list_items(&self, repo: &Repository) -> Result<Vec<ReviewableItem>, SourceError> {
        let review_count = self
            .settings_for(&repo.handle)
            .and_then(|s| s.review_count)
            .unwrap_or(0);
        let pulls = self.api.list_pulls(&repo.handle).await?;
        let mut items = Vec::with_capacity(pulls.len());
        for pull in pulls {
            items.push(self.build_item(&repo.handle, pull, review_count).await?);
        }
        Ok(items)
    }
}
