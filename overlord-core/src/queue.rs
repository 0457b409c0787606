//! Issue-queue scanner: enumerate ready issues across the watched
//! repositories and apply label transitions as work moves through
//! ready → in-progress → in-review / needs-attention.
//!
//! Scan failures are transient by definition: the scanner logs a warning
//! and returns what it has (possibly nothing) instead of raising into the
//! orchestrator. Label transitions are best-effort with a single retry;
//! they must not fail on closed or missing issues.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::QueueLabels;
use crate::minion::QueueItem;

/// Remaining API budget as reported by the queue source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Port for the external issue queue.
#[async_trait]
pub trait QueueScanner: Send + Sync {
    /// Ready items, highest priority first, oldest first within a priority.
    /// Never fails; transient upstream errors yield an empty (or partial)
    /// list and a warning.
    async fn scan(&self) -> Vec<QueueItem>;

    async fn mark_in_progress(&self, repo: &str, number: u64) -> Result<()>;
    async fn mark_in_review(&self, repo: &str, number: u64, pr_number: u64) -> Result<()>;
    async fn mark_failed(&self, repo: &str, number: u64, reason: &str) -> Result<()>;

    async fn rate_limit(&self) -> Option<RateLimit>;
}

/// Priority encoded as labels on the issue; higher wins.
pub fn priority_from_labels(labels: &[String]) -> i64 {
    labels
        .iter()
        .map(|l| match l.as_str() {
            "urgent" => 2,
            "high-priority" | "priority:high" => 1,
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Sort items by (priority desc, age asc). Items without a creation time
/// sort after dated ones of the same priority.
pub fn order_queue(items: &mut [QueueItem]) {
    items.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            match (a.created_at, b.created_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        })
    });
}

/// Map one issue from the queue source to a [`QueueItem`].
///
/// Returns `None` for pull requests (the issues listing includes them) and
/// for issues already in progress or in review.
fn parse_issue(repo: &str, issue: &Value, labels: &QueueLabels) -> Option<QueueItem> {
    if issue.get("pull_request").is_some() {
        return None;
    }
    let number = issue.get("number")?.as_u64()?;
    let title = issue.get("title")?.as_str()?.to_string();
    let label_names: Vec<String> = issue
        .get("labels")
        .and_then(Value::as_array)
        .map(|ls| {
            ls.iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if label_names.contains(&labels.in_progress) || label_names.contains(&labels.in_review) {
        return None;
    }

    let created_at = issue
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(QueueItem {
        repo: repo.to_string(),
        number,
        title,
        priority: priority_from_labels(&label_names),
        labels: label_names,
        created_at,
        url: issue
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ── GitHub implementation ─────────────────────────────────────────────────────

/// Queue scanner backed by the GitHub REST API.
pub struct GitHubQueue {
    client: reqwest::Client,
    api_base: String,
    token: String,
    repos: Vec<String>,
    labels: QueueLabels,
}

impl GitHubQueue {
    pub fn new(token: impl Into<String>, repos: Vec<String>, labels: QueueLabels) -> Self {
        Self::with_api_base("https://api.github.com", token, repos, labels)
    }

    /// Point the scanner at a different API base (test servers).
    pub fn with_api_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        repos: Vec<String>,
        labels: QueueLabels,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("overlord")
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
            repos,
            labels,
        }
    }

    async fn list_ready(&self, repo: &str) -> Result<Vec<QueueItem>> {
        let url = format!("{}/repos/{repo}/issues", self.api_base);
        let issues: Vec<Value> = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .query(&[
                ("labels", self.labels.ready.as_str()),
                ("state", "open"),
                ("per_page", "100"),
            ])
            .send()
            .await
            .context("issue listing request failed")?
            .error_for_status()
            .context("issue listing rejected")?
            .json()
            .await
            .context("issue listing body unreadable")?;

        Ok(issues
            .iter()
            .filter_map(|issue| parse_issue(repo, issue, &self.labels))
            .collect())
    }

    async fn add_label(&self, repo: &str, number: u64, label: &str) -> Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/labels", self.api_base);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "labels": [label] }))
            .send()
            .await?;
        // Closed or deleted issues must not fail a transition.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: u64, label: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{repo}/issues/{number}/labels/{label}",
            self.api_base
        );
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        // The label may already be gone; that is fine.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn transition(
        &self,
        repo: &str,
        number: u64,
        remove: Option<&str>,
        add: Option<&str>,
    ) -> Result<()> {
        if let Some(label) = remove {
            self.remove_label(repo, number, label).await?;
        }
        if let Some(label) = add {
            self.add_label(repo, number, label).await?;
        }
        Ok(())
    }

    /// One retry after a short pause; the caller logs the final failure.
    async fn transition_with_retry(
        &self,
        repo: &str,
        number: u64,
        remove: Option<&str>,
        add: Option<&str>,
    ) -> Result<()> {
        if let Err(first) = self.transition(repo, number, remove, add).await {
            debug!("label transition for {repo}#{number} failed, retrying: {first}");
            tokio::time::sleep(Duration::from_millis(500)).await;
            return self.transition(repo, number, remove, add).await;
        }
        Ok(())
    }

    async fn comment(&self, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = format!("{}/repos/{repo}/issues/{number}/comments", self.api_base);
        self.client
            .post(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "body": body }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl QueueScanner for GitHubQueue {
    async fn scan(&self) -> Vec<QueueItem> {
        let mut items = Vec::new();
        for repo in &self.repos {
            match self.list_ready(repo).await {
                Ok(mut batch) => items.append(&mut batch),
                Err(e) => warn!("queue scan failed for {repo}: {e:#}"),
            }
        }
        order_queue(&mut items);
        items
    }

    async fn mark_in_progress(&self, repo: &str, number: u64) -> Result<()> {
        self.transition_with_retry(
            repo,
            number,
            Some(&self.labels.ready),
            Some(&self.labels.in_progress),
        )
        .await
    }

    async fn mark_in_review(&self, repo: &str, number: u64, pr_number: u64) -> Result<()> {
        debug!("{repo}#{number} moving to review (PR #{pr_number})");
        self.transition_with_retry(
            repo,
            number,
            Some(&self.labels.in_progress),
            Some(&self.labels.in_review),
        )
        .await
    }

    async fn mark_failed(&self, repo: &str, number: u64, reason: &str) -> Result<()> {
        self.transition_with_retry(
            repo,
            number,
            Some(&self.labels.in_progress),
            Some(&self.labels.needs_attention),
        )
        .await?;

        let reason: String = reason.chars().take(500).collect();
        if let Err(e) = self.comment(repo, number, &format!("Minion failed: {reason}")).await {
            debug!("failure comment on {repo}#{number} not posted: {e}");
        }
        Ok(())
    }

    async fn rate_limit(&self) -> Option<RateLimit> {
        let url = format!("{}/rate_limit", self.api_base);
        let value: Value = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        let core = value.get("resources")?.get("core")?;
        Some(RateLimit {
            remaining: core.get("remaining")?.as_u64()?,
            limit: core.get("limit")?.as_u64()?,
            reset_at: core
                .get("reset")
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        })
    }
}

// ── Stub scanner ──────────────────────────────────────────────────────────────

/// Recorded label transition, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMark {
    InProgress { repo: String, number: u64 },
    InReview { repo: String, number: u64, pr_number: u64 },
    Failed { repo: String, number: u64, reason: String },
}

/// In-memory queue double: returns preset items and records transitions.
#[derive(Default)]
pub struct StubQueue {
    items: Mutex<Vec<QueueItem>>,
    marks: Mutex<Vec<QueueMark>>,
}

impl StubQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<QueueItem>) -> Self {
        Self {
            items: Mutex::new(items),
            marks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_items(&self, items: Vec<QueueItem>) {
        *self.items.lock().expect("stub queue lock") = items;
    }

    pub fn marks(&self) -> Vec<QueueMark> {
        self.marks.lock().expect("stub queue lock").clone()
    }
}

#[async_trait]
impl QueueScanner for StubQueue {
    async fn scan(&self) -> Vec<QueueItem> {
        let mut items = self.items.lock().expect("stub queue lock").clone();
        order_queue(&mut items);
        items
    }

    async fn mark_in_progress(&self, repo: &str, number: u64) -> Result<()> {
        self.marks
            .lock()
            .expect("stub queue lock")
            .push(QueueMark::InProgress {
                repo: repo.to_string(),
                number,
            });
        Ok(())
    }

    async fn mark_in_review(&self, repo: &str, number: u64, pr_number: u64) -> Result<()> {
        self.marks
            .lock()
            .expect("stub queue lock")
            .push(QueueMark::InReview {
                repo: repo.to_string(),
                number,
                pr_number,
            });
        Ok(())
    }

    async fn mark_failed(&self, repo: &str, number: u64, reason: &str) -> Result<()> {
        self.marks
            .lock()
            .expect("stub queue lock")
            .push(QueueMark::Failed {
                repo: repo.to_string(),
                number,
                reason: reason.to_string(),
            });
        Ok(())
    }

    async fn rate_limit(&self) -> Option<RateLimit> {
        Some(RateLimit {
            remaining: 5000,
            limit: 5000,
            reset_at: None,
        })
    }
}
