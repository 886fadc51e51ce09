use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use review_gator::clock::RunContext;
use review_gator::config::{self, Config};
use review_gator::reporters;
use review_gator::runner;
use review_gator::source::github::GithubAuth;
use review_gator::source::launchpad::LaunchpadCredentials;
use review_gator::source::{
    GithubClient, GithubSource, LaunchpadClient, LaunchpadSource, SourceAdapter,
};
use review_gator::verify::{CommandJob, JobLimit, VerificationScheduler};

#[derive(Debug, Parser)]
#[command(author, version, about = "Aggregate GitHub pull requests and Launchpad merge proposals into one review report")]
struct Args {
    /// Print an example config and exit
    #[arg(long)]
    config_skeleton: bool,

    /// Path to YAML config listing the repositories/branches to query
    #[arg(long, required_unless_present = "config_skeleton")]
    config: Option<PathBuf>,

    /// Directory the report and verification artifacts are written to
    #[arg(long, env = "REVIEW_GATOR_OUTPUT_DIRECTORY", default_value = "/tmp/review_gator")]
    output_directory: PathBuf,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "GITHUB_USERNAME")]
    github_username: Option<String>,

    #[arg(long, env = "GITHUB_PASSWORD", hide_env_values = true)]
    github_password: Option<String>,

    /// launchpadlib credentials store file; anonymous access when absent
    #[arg(long, env = "LP_CREDENTIALS_STORE")]
    lp_credentials_store: Option<PathBuf>,

    /// Keep running, one pass every --poll-interval seconds
    #[arg(long)]
    poll: bool,

    #[arg(long, default_value_t = 600)]
    poll_interval: u64,

    /// Run the verification command on flagged items
    #[arg(long, alias = "tox")]
    verify: bool,

    /// Concurrent verification jobs; -1 uses every available core
    #[arg(long, alias = "tox-jobs", default_value_t = -1, allow_negative_numbers = true)]
    verify_jobs: i64,

    #[arg(long, default_value = "tox")]
    verify_command: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.config_skeleton {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(args.config.as_deref()).context("failed to load config")?;
    let adapters = build_adapters(&cfg, &args)?;
    let reporters = reporters::enabled_reporters();
    let scheduler = args.verify.then(|| {
        VerificationScheduler::new(
            CommandJob::new(args.verify_command.clone()),
            args.output_directory.clone(),
            JobLimit::from_jobs(args.verify_jobs),
        )
    });

    loop {
        let ctx = RunContext::capture();
        match runner::run_pass(
            &adapters,
            &reporters,
            scheduler.as_ref(),
            &args.output_directory,
            &ctx,
        )
        .await
        {
            Ok(summary) => info!(
                report = %summary.report_path.display(),
                last_run = %ctx.now.format("%Y-%m-%d %H:%M:%S UTC"),
                "pass finished"
            ),
            Err(err) if runner::is_transient(&err) => {
                warn!(?err, "timed out querying github/launchpad; will retry");
            }
            Err(err) => return Err(err),
        }

        if !args.poll {
            return Ok(());
        }
        info!(seconds = args.poll_interval, "sleeping until next pass");
        tokio::time::sleep(Duration::from_secs(args.poll_interval)).await;
    }
}

/// Adapters in report order: lp-git, launchpad, github.
fn build_adapters(cfg: &Config, args: &Args) -> Result<Vec<Box<dyn SourceAdapter>>> {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    if cfg.lp_git.is_some() || cfg.launchpad.is_some() {
        let credentials = args
            .lp_credentials_store
            .as_deref()
            .map(LaunchpadCredentials::load)
            .transpose()?;
        let lp = LaunchpadClient::new(credentials).context("failed to build Launchpad client")?;
        if let Some(lp_git) = &cfg.lp_git {
            adapters.push(Box::new(LaunchpadSource::git(lp.clone(), lp_git.clone())));
        }
        if let Some(branches) = &cfg.launchpad {
            adapters.push(Box::new(LaunchpadSource::branches(lp, branches.clone())));
        }
    }

    if let Some(github) = cfg.github.as_ref().filter(|_| cfg.has_github()) {
        let auth = match (&args.github_token, &args.github_username, &args.github_password) {
            (Some(token), _, _) => Some(GithubAuth::Token(token.clone())),
            (None, Some(username), Some(password)) => Some(GithubAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        match auth {
            Some(auth) => {
                let gh = GithubClient::new(auth).context("failed to build GitHub client")?;
                adapters.push(Box::new(GithubSource::new(gh, github.clone())));
            }
            None => warn!(
                "github repositories are configured but no token or username/password was given; skipping github"
            ),
        }
    }

    Ok(adapters)
}
