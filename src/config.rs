//! Configuration loader and validator for the review sources file.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::VerificationSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema. Map order is kept so
/// repositories are discovered in the order they are listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(rename = "lp-git", default, skip_serializing_if = "Option::is_none")]
    pub lp_git: Option<LpGitSources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launchpad: Option<LaunchpadSources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubSources>,
}

/// Launchpad git repositories keyed by path (`lp:project`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LpGitSources {
    #[serde(default)]
    pub repos: IndexMap<String, RepoSettings>,
}

/// Launchpad branches keyed by URL, plus owners whose recent branches are
/// discovered automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchpadSources {
    #[serde(default)]
    pub branches: IndexMap<String, RepoSettings>,
    #[serde(default)]
    pub owners: IndexMap<String, OwnerSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct OwnerSettings {
    /// Only branches modified within this many days are considered.
    pub max_age: u32,
}

/// GitHub repositories grouped by organisation: `org -> name -> settings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GithubSources {
    #[serde(default)]
    pub repos: IndexMap<String, IndexMap<String, RepoSettings>>,
}

/// Settings shared by every configured repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RepoSettings {
    #[serde(default, alias = "tox")]
    pub verify: bool,
    #[serde(default = "default_true", alias = "parallel-tox")]
    pub parallel_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_name: Option<String>,
    /// Required approvals; mandatory for GitHub repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u32>,
}

impl Default for RepoSettings {
    fn default() -> Self {
        Self {
            verify: false,
            parallel_verify: true,
            environment: None,
            tab_name: None,
            review_count: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl RepoSettings {
    pub fn verification(&self) -> VerificationSettings {
        VerificationSettings {
            enabled: self.verify,
            parallel: self.parallel_verify,
            environment: self.environment.clone(),
        }
    }

    /// Tab label, ignoring blank values.
    pub fn tab_name(&self) -> Option<String> {
        self.tab_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

impl Config {
    pub fn has_github(&self) -> bool {
        self.github.as_ref().map_or(false, |g| !g.repos.is_empty())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate YAML content.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.lp_git.is_none() && cfg.launchpad.is_none() && cfg.github.is_none() {
        return Err(ConfigError::Invalid(
            "at least one of lp-git, launchpad or github must be configured",
        ));
    }

    if let Some(lp_git) = &cfg.lp_git {
        if lp_git.repos.keys().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid("lp-git.repos keys must be non-empty"));
        }
    }

    if let Some(lp) = &cfg.launchpad {
        if lp.branches.keys().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid("launchpad.branches keys must be non-empty"));
        }
        if lp.owners.keys().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid("launchpad.owners keys must be non-empty"));
        }
        if lp.owners.values().any(|o| o.max_age == 0) {
            return Err(ConfigError::Invalid("launchpad.owners.*.max-age must be > 0"));
        }
    }

    if let Some(gh) = &cfg.github {
        for (org, repos) in &gh.repos {
            if org.trim().is_empty() {
                return Err(ConfigError::Invalid("github.repos organisation must be non-empty"));
            }
            for (name, settings) in repos {
                if name.trim().is_empty() {
                    return Err(ConfigError::Invalid("github.repos names must be non-empty"));
                }
                if settings.review_count.is_none() {
                    return Err(ConfigError::Invalid("github.repos.*.*.review-count is required"));
                }
            }
        }
    }

    Ok(())
}

/// Sample configuration printed by `--config-skeleton`.
pub fn example() -> &'static str {
    r#"lp-git:
  repos:
    "lp:review-gator":
      verify: true
      parallel-verify: false
      environment: py3
      tab-name: Tools
    "lp:~team/project/+git/project": {}

launchpad:
  branches:
    "lp:~team/project/trunk": {}
  owners:
    some-team:
      max-age: 14

github:
  repos:
    canonical:
      review-gator:
        review-count: 2
        tab-name: Tools
      other-project:
        review-count: 1
        verify: true
"#
}
