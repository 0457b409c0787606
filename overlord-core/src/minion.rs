//! Minion domain model.
//!
//! A minion is one sandboxed worker container handling one issue. The
//! Overlord only ever sees a minion through its record here and the
//! lifecycle events it reports over HTTP.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a minion.
///
/// State machine:
///   Starting → Working → Completed | Failed | Timeout
///
/// Terminal statuses never transition again; the record is archived to
/// work history the moment one is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinionStatus {
    Starting,
    Working,
    Completed,
    Failed,
    Timeout,
}

impl MinionStatus {
    /// Whether this status represents a terminal (final) state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Whether this status represents an active (non-terminal) state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Working)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "working" => Some(Self::Working),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for MinionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single minion, active or just-dispatched.
///
/// At most one active record exists per (`repo`, `issue_number`); the
/// state store enforces this on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    /// Unique id, also the container name (`minion-<8 hex>`).
    pub id: String,
    /// Container reference, if the runtime reported one distinct from the id.
    pub container_ref: Option<String>,
    /// Repository in `owner/repo` form.
    pub repo: String,
    pub issue_number: u64,
    pub status: MinionStatus,
    pub started_at: DateTime<Utc>,
    /// Last heartbeat observed; monotonically non-decreasing.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pr_number: Option<u64>,
    pub error_message: Option<String>,
}

impl Minion {
    /// Fresh record for a just-spawned minion: `starting`, heartbeat now.
    pub fn dispatched(id: impl Into<String>, repo: impl Into<String>, issue_number: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            container_ref: None,
            repo: repo.into(),
            issue_number,
            status: MinionStatus::Starting,
            started_at: now,
            last_heartbeat: Some(now),
            pr_number: None,
            error_message: None,
        }
    }
}

/// Archived outcome of one minion. Append-only; never deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkHistoryEntry {
    pub minion_id: String,
    pub repo: String,
    pub issue_number: u64,
    pub pr_number: Option<u64>,
    pub status: MinionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub duration_seconds: i64,
}

/// Evaluation of a minion-produced PR, emitted by an external evaluator.
///
/// Scores are free-form strings owned by the evaluator ("pass", "fail",
/// letter grades); the core persists and serves them without interpreting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub pr_number: u64,
    pub repo: String,
    pub test_score: String,
    pub lint_score: String,
    pub review_score: String,
    pub overall: String,
    #[serde(default)]
    pub revision_number: i64,
    pub feedback: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// One ready issue from a queue scan. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub repo: String,
    pub number: u64,
    pub title: String,
    /// Explicit priority, higher wins. Ties break by age (oldest first).
    pub priority: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// A blocked minion's request for human clarification, bound to the chat
/// thread that will answer it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub minion_id: String,
    pub question_id: String,
    pub issue_number: u64,
    pub repo: String,
    pub question_text: String,
    /// Chat thread correlating replies back to this question. Unique
    /// across the registry.
    pub thread_ref: String,
    pub answered: bool,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_valid_statuses() {
        assert_eq!(MinionStatus::parse("starting"), Some(MinionStatus::Starting));
        assert_eq!(MinionStatus::parse("working"), Some(MinionStatus::Working));
        assert_eq!(
            MinionStatus::parse("completed"),
            Some(MinionStatus::Completed)
        );
        assert_eq!(MinionStatus::parse("failed"), Some(MinionStatus::Failed));
        assert_eq!(MinionStatus::parse("timeout"), Some(MinionStatus::Timeout));
    }

    #[test]
    fn parse_unknown_returns_none() {
        assert_eq!(MinionStatus::parse(""), None);
        assert_eq!(MinionStatus::parse("done"), None);
        assert_eq!(MinionStatus::parse("STARTING"), None);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for status in [
            MinionStatus::Starting,
            MinionStatus::Working,
            MinionStatus::Completed,
            MinionStatus::Failed,
            MinionStatus::Timeout,
        ] {
            let s = status.to_string();
            assert_eq!(MinionStatus::parse(&s), Some(status));
        }
    }

    #[test]
    fn terminal_and_active_are_complementary() {
        for status in [
            MinionStatus::Starting,
            MinionStatus::Working,
            MinionStatus::Completed,
            MinionStatus::Failed,
            MinionStatus::Timeout,
        ] {
            assert_ne!(
                status.is_terminal(),
                status.is_active(),
                "{status:?} should be either terminal or active, not both or neither",
            );
        }
    }

    #[test]
    fn dispatched_minion_is_starting_with_heartbeat() {
        let m = Minion::dispatched("minion-ab12cd34", "owner/repo", 42);
        assert_eq!(m.status, MinionStatus::Starting);
        assert_eq!(m.repo, "owner/repo");
        assert_eq!(m.issue_number, 42);
        assert!(m.last_heartbeat.is_some());
        assert!(m.pr_number.is_none());
    }

    #[test]
    fn queue_item_display() {
        let item = QueueItem {
            repo: "owner/repo".to_string(),
            number: 7,
            title: "Fix the bug".to_string(),
            priority: 0,
            labels: vec![],
            created_at: None,
            url: None,
        };
        assert_eq!(item.to_string(), "owner/repo#7");
    }

    #[test]
    fn status_serde_uses_lowercase() {
        let json = serde_json::to_string(&MinionStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        let back: MinionStatus = serde_json::from_str("\"working\"").unwrap();
        assert_eq!(back, MinionStatus::Working);
    }
}
