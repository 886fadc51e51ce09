//! Report data handed to renderers and reporters, plus the JSON and HTML
//! outputs written into the output directory.
use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::clock::{RunContext, Timestamp};
use crate::model::{Repository, Review, ReviewableItem};

pub const JSON_FILE: &str = "reviews.json";
pub const HTML_FILE: &str = "reviews.html";

#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    pub generated_at: Timestamp,
    /// Keyed by repository name, in aggregation order.
    pub repos: IndexMap<String, RepoData>,
    /// Distinct non-empty tab names, in first-seen order.
    pub dedicated_tabs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoData {
    pub url: String,
    pub name: String,
    pub short_name: String,
    pub verification_enabled: bool,
    pub items: Vec<ItemData>,
    pub tab_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemData {
    pub id: String,
    /// Name of the item's `.svg` / `.log` status artifacts.
    pub artifact_key: String,
    pub url: String,
    pub title: String,
    pub owner: String,
    pub state: String,
    pub created_at: Timestamp,
    pub age: String,
    pub latest_activity_at: Timestamp,
    pub latest_activity_age: String,
    pub required_review_count: u32,
    pub reviews: Vec<ReviewData>,
    /// Set for items queued for verification in this pass.
    pub verification_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewData {
    pub url: String,
    pub owner: String,
    pub result: String,
    pub submitted_at: Timestamp,
    pub age: String,
}

fn review_data(review: &Review, ctx: &RunContext) -> ReviewData {
    ReviewData {
        url: review.url.clone(),
        owner: review.owner.clone(),
        result: review.result.clone(),
        submitted_at: review.submitted_at,
        age: review.age(ctx),
    }
}

fn item_data(repo: &Repository, item: &ReviewableItem, ctx: &RunContext) -> ItemData {
    let artifact_key = repo.artifact_key(item);
    let flagged = repo.flagged.iter().any(|f| f.id == artifact_key);
    ItemData {
        id: item.id().to_string(),
        url: item.url.clone(),
        title: item.title.clone(),
        owner: item.owner.clone(),
        state: item.state.clone(),
        created_at: item.created_at,
        age: item.age(ctx),
        latest_activity_at: item.latest_activity_at,
        latest_activity_age: item.latest_activity_age(ctx),
        required_review_count: item.required_review_count,
        reviews: item.reviews.iter().map(|r| review_data(r, ctx)).collect(),
        verification_status: flagged.then(|| "PENDING".to_string()),
        artifact_key,
    }
}

/// Build the report mapping for one pass. Every age is measured against
/// `ctx.now`.
pub fn build(repos: &[Repository], ctx: &RunContext) -> ReportData {
    let mut out: IndexMap<String, RepoData> = IndexMap::new();
    for repo in repos {
        out.insert(
            repo.name.clone(),
            RepoData {
                url: repo.url.clone(),
                name: repo.name.clone(),
                short_name: repo.short_name().to_string(),
                verification_enabled: repo.verification.enabled,
                items: repo.items.iter().map(|i| item_data(repo, i, ctx)).collect(),
                tab_name: repo.tab_name.clone(),
            },
        );
    }

    let mut dedicated_tabs: Vec<String> = Vec::new();
    for tab in out.values().filter_map(|r| r.tab_name.as_deref()) {
        if !tab.is_empty() && !dedicated_tabs.iter().any(|t| t == tab) {
            dedicated_tabs.push(tab.to_string());
        }
    }

    ReportData {
        generated_at: ctx.now.into(),
        repos: out,
        dedicated_tabs,
    }
}

/// Write `reviews.json` and `reviews.html` into `output_dir` and return the
/// HTML path.
pub async fn write(output_dir: &Path, data: &ReportData, verify: bool) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let json_path = output_dir.join(JSON_FILE);
    let json = serde_json::to_string_pretty(data).context("failed to serialize report")?;
    tokio::fs::write(&json_path, json)
        .await
        .with_context(|| format!("failed to write {}", json_path.display()))?;

    let html_path = output_dir.join(HTML_FILE);
    tokio::fs::write(&html_path, render_html(data, verify))
        .await
        .with_context(|| format!("failed to write {}", html_path.display()))?;
    info!(path = %html_path.display(), "report written");
    Ok(html_path)
}

/// Tab a repository is listed under; untabbed repositories share "all".
fn tab_of(repo: &RepoData) -> &str {
    repo.tab_name.as_deref().filter(|t| !t.is_empty()).unwrap_or("all")
}

fn render_item(item: &ItemData, verify: bool) -> String {
    let mut row = String::new();
    row.push_str("<tr>");
    if verify {
        if item.verification_status.is_some() {
            row.push_str(&format!(
                "<td class=\"status\"><a href=\"{key}.log\"><img src=\"{key}.svg\" alt=\"verification\" width=\"16\" height=\"16\" /></a></td>",
                key = html_attr(&item.artifact_key)
            ));
        } else {
            row.push_str("<td class=\"status\"></td>");
        }
    }
    let mut title_lines = item.title.lines();
    let headline = title_lines.next().unwrap_or("");
    let detail: Vec<&str> = title_lines.collect();
    row.push_str(&format!(
        "<td><a href=\"{}\">{}</a>",
        html_attr(&item.url),
        html_escape(headline)
    ));
    if !detail.is_empty() {
        row.push_str(&format!(
            "<div class=\"muted\">{}</div>",
            html_escape(&detail.join(" "))
        ));
    }
    row.push_str("</td>");
    row.push_str(&format!("<td>{}</td>", html_escape(&item.owner)));
    row.push_str(&format!("<td>{}</td>", html_escape(&item.state)));
    row.push_str(&format!(
        "<td title=\"{}\">{}</td>",
        html_attr(&item.created_at.to_rfc3339()),
        html_escape(&item.age)
    ));
    row.push_str(&format!(
        "<td title=\"{}\">{}</td>",
        html_attr(&item.latest_activity_at.to_rfc3339()),
        html_escape(&item.latest_activity_age)
    ));

    let mut reviews = String::new();
    for r in &item.reviews {
        reviews.push_str(&format!(
            "<a class=\"review\" href=\"{}\" title=\"{}\">{}: {}</a> ",
            html_attr(&r.url),
            html_attr(&r.age),
            html_escape(&r.owner),
            html_escape(&r.result)
        ));
    }
    row.push_str(&format!(
        "<td>{}<span class=\"muted\">({}/{})</span></td>",
        reviews,
        item.reviews.len(),
        item.required_review_count
    ));
    row.push_str("</tr>\n");
    row
}

fn render_repo(repo: &RepoData, verify: bool) -> String {
    let show_status = verify && repo.verification_enabled;
    let mut section = String::new();
    section.push_str(&format!(
        "<section class=\"repo\" data-tab=\"{}\"><h2><a href=\"{}\" title=\"{}\">{}</a></h2>\n<table>\n<tr>",
        html_attr(tab_of(repo)),
        html_attr(&repo.url),
        html_attr(&repo.name),
        html_escape(&repo.short_name)
    ));
    if show_status {
        section.push_str("<th></th>");
    }
    section.push_str("<th>Title</th><th>Owner</th><th>State</th><th>Age</th><th>Activity</th><th>Reviews</th></tr>\n");
    for item in &repo.items {
        section.push_str(&render_item(item, show_status));
    }
    section.push_str("</table></section>\n");
    section
}

pub fn render_html(data: &ReportData, verify: bool) -> String {
    let mut tabs = String::from("<button class=\"tab\" data-tab=\"all\">all</button>");
    for tab in &data.dedicated_tabs {
        tabs.push_str(&format!(
            "<button class=\"tab\" data-tab=\"{}\">{}</button>",
            html_attr(tab),
            html_escape(tab)
        ));
    }
    let mut body = String::new();
    for repo in data.repos.values() {
        body.push_str(&render_repo(repo, verify));
    }

    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Reviews</title>
    <style>{}</style>
  </head>
  <body>
    <header>
      <h1>Reviews</h1>
      <nav>{}</nav>
      <p class="muted">Last run @ {}</p>
    </header>
    <main>
      {}
    </main>
    <script>{}</script>
  </body>
</html>"#,
        STYLE,
        tabs,
        html_escape(
            &data
                .generated_at
                .with_timezone(&Utc)
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
        ),
        body,
        TAB_SCRIPT
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
fn html_attr(s: &str) -> String {
    html_escape(s).replace('"', "&quot;")
}

const STYLE: &str = r#"
:root { color-scheme: light dark; --fg: #222; --bg: #fff; --muted: #666; }
@media (prefers-color-scheme: dark) { :root { --fg: #ddd; --bg: #111; --muted: #999; } }
body { font-family: system-ui, sans-serif; color: var(--fg); background: var(--bg); margin: 1.5rem; }
table { border-collapse: collapse; width: 100%; margin-bottom: 1.5rem; }
th, td { text-align: left; padding: .25rem .5rem; vertical-align: top; }
tr:nth-child(even) { background: rgba(127,127,127,.08); }
.muted { color: var(--muted); font-size: .85em; }
.review { margin-right: .5rem; white-space: nowrap; }
.tab { margin-right: .25rem; }
"#;

const TAB_SCRIPT: &str = r#"
document.querySelectorAll('.tab').forEach(function (btn) {
  btn.addEventListener('click', function () {
    var tab = btn.dataset.tab;
    document.querySelectorAll('.repo').forEach(function (s) {
      s.style.display = (tab === 'all' || s.dataset.tab === tab) ? '' : 'none';
    });
  });
});
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_timestamp;
    use crate::model::{SourceKind, VerificationSettings};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn ctx() -> RunContext {
        RunContext::at(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
    }

    fn item(url: &str, state: &str) -> ReviewableItem {
        let ts = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        ReviewableItem {
            source_kind: SourceKind::Github,
            url: url.into(),
            title: "Fix <thing>\nlonger detail".into(),
            owner: "alice".into(),
            state: state.into(),
            created_at: ts,
            latest_activity_at: ts,
            required_review_count: 2,
            reviews: Vec::new(),
            source_branch: None,
        }
    }

    fn repo(name: &str, tab: Option<&str>) -> Repository {
        let mut r = Repository::new(SourceKind::Github, name, name, format!("https://github.com/{}", name))
            .with_tab_name(tab.map(str::to_string))
            .with_verification(VerificationSettings {
                enabled: true,
                ..Default::default()
            });
        let open = item(&format!("https://github.com/{}/pull/1", name), "open");
        r.add_flagged(&open);
        r.add(open);
        r.add(item(&format!("https://github.com/{}/pull/2", name), "closed"));
        r
    }

    #[test]
    fn build_collects_distinct_tabs_in_order() {
        let repos = vec![
            repo("org/a", Some("team")),
            repo("org/b", None),
            repo("org/c", Some("team")),
            repo("org/d", Some("ops")),
        ];
        let data = build(&repos, &ctx());
        assert_eq!(data.dedicated_tabs, vec!["team", "ops"]);
        let keys: Vec<&str> = data.repos.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["org/a", "org/b", "org/c", "org/d"]);
        let a = &data.repos["org/a"];
        assert_eq!(a.short_name, "a");
        assert_eq!(a.items[0].age, "2 days ago");
        assert_eq!(a.items[0].verification_status.as_deref(), Some("PENDING"));
        assert!(a.items[1].verification_status.is_none());
    }

    #[test]
    fn html_escapes_titles_and_links_status_artifacts() {
        let data = build(&[repo("org/a", None)], &ctx());
        let html = render_html(&data, true);
        assert!(html.contains("Fix &lt;thing&gt;"));
        assert!(html.contains("href=\"org-a-1.log\""));
        assert!(html.contains("src=\"org-a-1.svg\""));
        assert!(!html.contains("2.svg"));
        assert!(html.contains("Last run @ 2024-01-03 00:00:00 UTC"));

        let plain = render_html(&data, false);
        assert!(!plain.contains(".svg"));
    }

    #[test]
    fn same_pull_number_in_two_repositories_links_distinct_artifacts() {
        let data = build(&[repo("org/a", None), repo("org/b", None)], &ctx());
        assert_eq!(data.repos["org/a"].items[0].id, data.repos["org/b"].items[0].id);
        assert_eq!(data.repos["org/a"].items[0].artifact_key, "org-a-1");
        assert_eq!(data.repos["org/b"].items[0].artifact_key, "org-b-1");

        let html = render_html(&data, true);
        assert_eq!(html.matches("src=\"org-a-1.svg\"").count(), 1);
        assert_eq!(html.matches("src=\"org-b-1.svg\"").count(), 1);
        assert!(!html.contains("src=\"1.svg\""));
    }

    #[tokio::test]
    async fn write_produces_json_and_html() {
        let td = tempdir().unwrap();
        let data = build(&[repo("org/a", Some("team"))], &ctx());
        let html_path = write(td.path(), &data, false).await.unwrap();
        assert!(html_path.ends_with(HTML_FILE));

        let raw = std::fs::read_to_string(td.path().join(JSON_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["dedicated_tabs"][0], "team");
        assert_eq!(json["repos"]["org/a"]["items"][0]["id"], "1");
        assert_eq!(json["repos"]["org/a"]["items"][0]["artifact_key"], "org-a-1");
    }
}
