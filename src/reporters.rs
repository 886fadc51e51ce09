//! Optional metric reporters fed with each pass's report data.
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::RunContext;
use crate::report::ReportData;

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, data: &ReportData, ctx: &RunContext) -> Result<()>;
}

/// Sum of `now - created_at` over every item, in seconds.
pub fn total_age_seconds(data: &ReportData, ctx: &RunContext) -> f64 {
    data.repos
        .values()
        .flat_map(|repo| repo.items.iter())
        .map(|item| ctx.elapsed(&item.created_at).num_milliseconds() as f64 / 1000.0)
        .sum()
}

const DEFAULT_INFLUXDB_HOST: &str = "localhost";
const DEFAULT_INFLUXDB_PORT: u16 = 8086;

/// Pushes the total review age to an InfluxDB 1.x `/write` endpoint.
#[derive(Clone)]
pub struct InfluxDbTotalAgeReporter {
    http: Client,
    write_url: Url,
    metric: String,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for InfluxDbTotalAgeReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDbTotalAgeReporter")
            .field("write_url", &self.write_url)
            .field("metric", &self.metric)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl InfluxDbTotalAgeReporter {
    /// Returns `None` unless `REVIEW_GATOR_METRIC_NAME` is set.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(metric) = lookup("REVIEW_GATOR_METRIC_NAME").filter(|m| !m.trim().is_empty())
        else {
            return Ok(None);
        };
        let host = lookup("INFLUXDB_HOST").unwrap_or_else(|| DEFAULT_INFLUXDB_HOST.to_string());
        let port = match lookup("INFLUXDB_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid INFLUXDB_PORT: {}", raw))?,
            None => DEFAULT_INFLUXDB_PORT,
        };
        let write_url = Url::parse(&format!("http://{}:{}/write", host, port))
            .with_context(|| format!("invalid InfluxDB host: {}", host))?;
        let http = Client::builder()
            .user_agent("review-gator/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build InfluxDB client")?;
        Ok(Some(Self {
            http,
            write_url,
            metric,
            database: lookup("INFLUXDB_DATABASE"),
            username: lookup("INFLUXDB_USERNAME"),
            password: lookup("INFLUXDB_PASSWORD"),
        }))
    }

    /// One line of InfluxDB line protocol.
    pub fn line(&self, total_age: f64) -> String {
        format!("{} total_age={}", escape_measurement(&self.metric), total_age)
    }

    pub fn build_request(&self, total_age: f64) -> Result<reqwest::Request> {
        let mut url = self.write_url.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(db) = &self.database {
                query.append_pair("db", db);
            }
            if let Some(user) = &self.username {
                query.append_pair("u", user);
            }
            if let Some(password) = &self.password {
                query.append_pair("p", password);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.http
            .post(url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(self.line(total_age))
            .build()
            .context("failed to build InfluxDB request")
    }
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

#[async_trait]
impl Reporter for InfluxDbTotalAgeReporter {
    fn name(&self) -> &'static str {
        "influxdb-total-age"
    }

    async fn process(&self, data: &ReportData, ctx: &RunContext) -> Result<()> {
        let total_age = total_age_seconds(data, ctx);
        let request = self.build_request(total_age)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach InfluxDB")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("InfluxDB write failed: {} {}", status, body);
        }
        info!(metric = %self.metric, total_age, "reported total review age");
        Ok(())
    }
}

/// Reporters enabled by the environment.
pub fn enabled_reporters() -> Vec<Box<dyn Reporter>> {
    enabled_reporters_from(|key| std::env::var(key).ok())
}

/// Reporters enabled by `lookup`. A reporter whose settings are invalid is
/// left disabled with a warning.
pub fn enabled_reporters_from<F>(lookup: F) -> Vec<Box<dyn Reporter>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out: Vec<Box<dyn Reporter>> = Vec::new();
    match InfluxDbTotalAgeReporter::from_lookup(&lookup) {
        Ok(Some(influx)) => out.push(Box::new(influx)),
        Ok(None) => {}
        Err(err) => warn!(reporter = "influxdb-total-age", ?err, "invalid reporter settings; reporter disabled"),
    }
    out
}

/// Run every reporter; failures are logged and never propagated.
pub async fn run_all(reporters: &[Box<dyn Reporter>], data: &ReportData, ctx: &RunContext) {
    for reporter in reporters {
        if let Err(err) = reporter.process(data, ctx).await {
            warn!(reporter = reporter.name(), ?err, "reporter failed");
        }
    }
}
