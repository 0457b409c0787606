//! Durable state: active minions, work history, evaluations.
//!
//! One SQLite file, three tables. All mutating operations run inside a
//! transaction on a shared pool, so writers serialise and readers always
//! see the last committed state; after a crash, `get_active()` returns
//! exactly the rows that were durably committed.
//!
//! Timestamps are stored as RFC 3339 UTC text so `ORDER BY` on them is
//! chronological. Rows carrying a status string this build does not know
//! are logged loudly and skipped, never fatal.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::error;

use crate::error::StoreError;
use crate::minion::{EvaluationRecord, Minion, MinionStatus, WorkHistoryEntry};

/// Stamped into `PRAGMA user_version`; bump on schema changes.
const SCHEMA_VERSION: i64 = 1;

const CREATE_ACTIVE: &str = "
CREATE TABLE IF NOT EXISTS active_minions (
    id TEXT PRIMARY KEY,
    container_ref TEXT,
    repo TEXT NOT NULL,
    issue_number INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'starting',
    started_at TEXT NOT NULL,
    last_heartbeat TEXT,
    pr_number INTEGER,
    error_message TEXT
)";

const CREATE_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS work_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    minion_id TEXT NOT NULL,
    repo TEXT NOT NULL,
    issue_number INTEGER NOT NULL,
    pr_number INTEGER,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    error_message TEXT,
    duration_seconds INTEGER NOT NULL
)";

const CREATE_EVALUATIONS: &str = "
CREATE TABLE IF NOT EXISTS evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pr_number INTEGER NOT NULL,
    repo TEXT NOT NULL,
    test_score TEXT NOT NULL,
    lint_score TEXT NOT NULL,
    review_score TEXT NOT NULL,
    overall TEXT NOT NULL,
    revision_number INTEGER NOT NULL DEFAULT 0,
    feedback TEXT,
    evaluated_at TEXT NOT NULL
)";

/// Partial update for an active minion. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct MinionUpdate {
    pub status: Option<MinionStatus>,
    pub container_ref: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pr_number: Option<u64>,
    pub error_message: Option<String>,
}

impl MinionUpdate {
    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: Some(at),
            ..Self::default()
        }
    }

    pub fn working(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MinionStatus::Working),
            last_heartbeat: Some(at),
            ..Self::default()
        }
    }
}

pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if needed) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StoreError::Db(sqlx::Error::Io(e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let row = sqlx::query("PRAGMA user_version").fetch_one(&self.pool).await?;
        let version: i64 = row.try_get(0)?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew(version));
        }

        sqlx::query(CREATE_ACTIVE).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_active_minions_status ON active_minions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_HISTORY).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_repo ON work_history(repo)")
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_EVALUATIONS).execute(&self.pool).await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a freshly dispatched minion.
    ///
    /// Fails with [`StoreError::Duplicate`] when an active minion already
    /// exists for the same (repo, issue_number).
    pub async fn add_minion(&self, minion: &Minion) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM active_minions
             WHERE repo = ? AND issue_number = ? AND status IN ('starting', 'working')",
        )
        .bind(&minion.repo)
        .bind(minion.issue_number as i64)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(StoreError::Duplicate {
                repo: minion.repo.clone(),
                issue_number: minion.issue_number,
            });
        }

        sqlx::query(
            "INSERT INTO active_minions
             (id, container_ref, repo, issue_number, status, started_at, last_heartbeat,
              pr_number, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&minion.id)
        .bind(&minion.container_ref)
        .bind(&minion.repo)
        .bind(minion.issue_number as i64)
        .bind(minion.status.as_str())
        .bind(minion.started_at.to_rfc3339())
        .bind(minion.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(minion.pr_number.map(|n| n as i64))
        .bind(&minion.error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Apply a partial update to an active minion and return the new record.
    ///
    /// A heartbeat older than the stored one is clamped: `last_heartbeat`
    /// never goes backwards.
    pub async fn update_minion(
        &self,
        minion_id: &str,
        update: MinionUpdate,
    ) -> Result<Minion, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM active_minions WHERE id = ?")
            .bind(minion_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut minion = row
            .as_ref()
            .and_then(row_to_minion)
            .ok_or_else(|| StoreError::NotFound(minion_id.to_string()))?;

        if let Some(status) = update.status {
            minion.status = status;
        }
        if let Some(container_ref) = update.container_ref {
            minion.container_ref = Some(container_ref);
        }
        if let Some(heartbeat) = update.last_heartbeat {
            minion.last_heartbeat = Some(match minion.last_heartbeat {
                Some(old) => old.max(heartbeat),
                None => heartbeat,
            });
        }
        if let Some(pr_number) = update.pr_number {
            minion.pr_number = Some(pr_number);
        }
        if let Some(error_message) = update.error_message {
            minion.error_message = Some(error_message);
        }

        sqlx::query(
            "UPDATE active_minions
             SET container_ref = ?, status = ?, last_heartbeat = ?, pr_number = ?,
                 error_message = ?
             WHERE id = ?",
        )
        .bind(&minion.container_ref)
        .bind(minion.status.as_str())
        .bind(minion.last_heartbeat.map(|t| t.to_rfc3339()))
        .bind(minion.pr_number.map(|n| n as i64))
        .bind(&minion.error_message)
        .bind(minion_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(minion)
    }

    pub async fn get(&self, minion_id: &str) -> Result<Option<Minion>, StoreError> {
        let row = sqlx::query("SELECT * FROM active_minions WHERE id = ?")
            .bind(minion_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().and_then(row_to_minion))
    }

    /// All active (non-terminal) minions, oldest dispatch first.
    pub async fn get_active(&self) -> Result<Vec<Minion>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM active_minions
             WHERE status IN ('starting', 'working')
             ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_minion).collect())
    }

    pub async fn active_count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM active_minions WHERE status IN ('starting', 'working')",
        )
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }

    /// The active minion working a specific issue, if any.
    pub async fn get_by_issue(
        &self,
        repo: &str,
        issue_number: u64,
    ) -> Result<Option<Minion>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM active_minions
             WHERE repo = ? AND issue_number = ? AND status IN ('starting', 'working')",
        )
        .bind(repo)
        .bind(issue_number as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().and_then(row_to_minion))
    }

    /// Archive a minion: insert into history and drop from the active
    /// table, atomically. Retrying after the archive happened returns
    /// [`StoreError::AlreadyArchived`].
    pub async fn record_completion(
        &self,
        minion: &Minion,
        status: MinionStatus,
        pr_number: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<WorkHistoryEntry, StoreError> {
        let completed_at = Utc::now();
        let duration_seconds = (completed_at - minion.started_at).num_seconds().max(0);

        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM active_minions WHERE id = ?")
            .bind(&minion.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::AlreadyArchived(minion.id.clone()));
        }

        let entry = WorkHistoryEntry {
            minion_id: minion.id.clone(),
            repo: minion.repo.clone(),
            issue_number: minion.issue_number,
            pr_number: pr_number.or(minion.pr_number),
            status,
            started_at: minion.started_at,
            completed_at,
            error_message: error_message.map(str::to_string),
            duration_seconds,
        };

        sqlx::query(
            "INSERT INTO work_history
             (minion_id, repo, issue_number, pr_number, status, started_at, completed_at,
              error_message, duration_seconds)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.minion_id)
        .bind(&entry.repo)
        .bind(entry.issue_number as i64)
        .bind(entry.pr_number.map(|n| n as i64))
        .bind(entry.status.as_str())
        .bind(entry.started_at.to_rfc3339())
        .bind(entry.completed_at.to_rfc3339())
        .bind(&entry.error_message)
        .bind(entry.duration_seconds)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Work history, most recent first, optionally filtered.
    pub async fn history(
        &self,
        repo: Option<&str>,
        status: Option<MinionStatus>,
        limit: usize,
    ) -> Result<Vec<WorkHistoryEntry>, StoreError> {
        let mut sql = String::from("SELECT * FROM work_history WHERE 1=1");
        if repo.is_some() {
            sql.push_str(" AND repo = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY completed_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(repo) = repo {
            query = query.bind(repo.to_string());
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(row_to_history).collect())
    }

    /// Distinct repositories seen in work history, sorted.
    pub async fn distinct_repos(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT repo FROM work_history ORDER BY repo")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("repo").ok())
            .collect())
    }

    pub async fn save_evaluation(&self, evaluation: &EvaluationRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO evaluations
             (pr_number, repo, test_score, lint_score, review_score, overall,
              revision_number, feedback, evaluated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(evaluation.pr_number as i64)
        .bind(&evaluation.repo)
        .bind(&evaluation.test_score)
        .bind(&evaluation.lint_score)
        .bind(&evaluation.review_score)
        .bind(&evaluation.overall)
        .bind(evaluation.revision_number)
        .bind(&evaluation.feedback)
        .bind(evaluation.evaluated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Evaluation history for one PR, oldest first.
    pub async fn evaluations(
        &self,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<EvaluationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM evaluations WHERE repo = ? AND pr_number = ? ORDER BY evaluated_at",
        )
        .bind(repo)
        .bind(pr_number as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_evaluation).collect())
    }
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(text) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            error!("unparsable timestamp `{text}` in state db: {e}");
            None
        }
    }
}

fn row_to_minion(row: &SqliteRow) -> Option<Minion> {
    let status_text: String = row.try_get("status").ok()?;
    let Some(status) = MinionStatus::parse(&status_text) else {
        error!("unknown minion status `{status_text}` in state db; skipping row");
        return None;
    };
    Some(Minion {
        id: row.try_get("id").ok()?,
        container_ref: row.try_get("container_ref").ok()?,
        repo: row.try_get("repo").ok()?,
        issue_number: row.try_get::<i64, _>("issue_number").ok()? as u64,
        status,
        started_at: parse_ts(&row.try_get::<String, _>("started_at").ok()?)?,
        last_heartbeat: row
            .try_get::<Option<String>, _>("last_heartbeat")
            .ok()?
            .as_deref()
            .and_then(parse_ts),
        pr_number: row
            .try_get::<Option<i64>, _>("pr_number")
            .ok()?
            .map(|n| n as u64),
        error_message: row.try_get("error_message").ok()?,
    })
}

fn row_to_history(row: &SqliteRow) -> Option<WorkHistoryEntry> {
    let status_text: String = row.try_get("status").ok()?;
    let Some(status) = MinionStatus::parse(&status_text) else {
        error!("unknown history status `{status_text}` in state db; skipping row");
        return None;
    };
    Some(WorkHistoryEntry {
        minion_id: row.try_get("minion_id").ok()?,
        repo: row.try_get("repo").ok()?,
        issue_number: row.try_get::<i64, _>("issue_number").ok()? as u64,
        pr_number: row
            .try_get::<Option<i64>, _>("pr_number")
            .ok()?
            .map(|n| n as u64),
        status,
        started_at: parse_ts(&row.try_get::<String, _>("started_at").ok()?)?,
        completed_at: parse_ts(&row.try_get::<String, _>("completed_at").ok()?)?,
        error_message: row.try_get("error_message").ok()?,
        duration_seconds: row.try_get("duration_seconds").ok()?,
    })
}

fn row_to_evaluation(row: &SqliteRow) -> Option<EvaluationRecord> {
    Some(EvaluationRecord {
        pr_number: row.try_get::<i64, _>("pr_number").ok()? as u64,
        repo: row.try_get("repo").ok()?,
        test_score: row.try_get("test_score").ok()?,
        lint_score: row.try_get("lint_score").ok()?,
        review_score: row.try_get("review_score").ok()?,
        overall: row.try_get("overall").ok()?,
        revision_number: row.try_get("revision_number").ok()?,
        feedback: row.try_get("feedback").ok()?,
        evaluated_at: parse_ts(&row.try_get::<String, _>("evaluated_at").ok()?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (StateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&dir.path().join("state.db")).await.unwrap();
        (store, dir)
    }

    fn minion(id: &str, repo: &str, issue: u64) -> Minion {
        Minion::dispatched(id, repo, issue)
    }

    // ── add / get ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let (store, _dir) = store().await;
        let m = minion("minion-1", "o/r", 42);
        store.add_minion(&m).await.unwrap();

        let loaded = store.get("minion-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, m.id);
        assert_eq!(loaded.repo, m.repo);
        assert_eq!(loaded.issue_number, 42);
        assert_eq!(loaded.status, MinionStatus::Starting);
        // Second-level equality is enough; SQLite text keeps full precision
        // but wall-clock resolution is not part of the contract.
        assert_eq!(
            loaded.started_at.timestamp(),
            m.started_at.timestamp()
        );
    }

    #[tokio::test]
    async fn duplicate_issue_rejected_while_active() {
        let (store, _dir) = store().await;
        store.add_minion(&minion("minion-1", "o/r", 42)).await.unwrap();

        let err = store
            .add_minion(&minion("minion-2", "o/r", 42))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { issue_number: 42, .. }));

        // A different issue is fine.
        store.add_minion(&minion("minion-3", "o/r", 43)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_allowed_after_archive() {
        let (store, _dir) = store().await;
        let m = minion("minion-1", "o/r", 42);
        store.add_minion(&m).await.unwrap();
        store
            .record_completion(&m, MinionStatus::Completed, None, None)
            .await
            .unwrap();

        store.add_minion(&minion("minion-2", "o/r", 42)).await.unwrap();
    }

    #[tokio::test]
    async fn get_by_issue_finds_only_active() {
        let (store, _dir) = store().await;
        let m = minion("minion-1", "o/r", 42);
        store.add_minion(&m).await.unwrap();

        assert!(store.get_by_issue("o/r", 42).await.unwrap().is_some());
        assert!(store.get_by_issue("o/r", 7).await.unwrap().is_none());
        assert!(store.get_by_issue("other/r", 42).await.unwrap().is_none());

        store
            .record_completion(&m, MinionStatus::Failed, None, Some("x"))
            .await
            .unwrap();
        assert!(store.get_by_issue("o/r", 42).await.unwrap().is_none());
    }

    // ── update ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_unknown_minion_is_not_found() {
        let (store, _dir) = store().await;
        let err = store
            .update_minion("minion-ghost", MinionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_applies_partial_fields() {
        let (store, _dir) = store().await;
        store.add_minion(&minion("minion-1", "o/r", 42)).await.unwrap();

        let updated = store
            .update_minion(
                "minion-1",
                MinionUpdate {
                    status: Some(MinionStatus::Working),
                    pr_number: Some(99),
                    ..MinionUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, MinionStatus::Working);
        assert_eq!(updated.pr_number, Some(99));
        // Untouched fields survive.
        assert_eq!(updated.issue_number, 42);
    }

    #[tokio::test]
    async fn heartbeat_never_goes_backwards() {
        let (store, _dir) = store().await;
        store.add_minion(&minion("minion-1", "o/r", 42)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        let earlier = Utc::now() - chrono::Duration::seconds(60);

        let m = store
            .update_minion("minion-1", MinionUpdate::heartbeat(later))
            .await
            .unwrap();
        assert_eq!(m.last_heartbeat.unwrap().timestamp(), later.timestamp());

        let m = store
            .update_minion("minion-1", MinionUpdate::heartbeat(earlier))
            .await
            .unwrap();
        assert_eq!(m.last_heartbeat.unwrap().timestamp(), later.timestamp());
    }

    // ── record_completion ──────────────────────────────────────────────────

    #[tokio::test]
    async fn completion_archives_and_leaves_history() {
        let (store, _dir) = store().await;
        let m = minion("minion-1", "o/r", 42);
        store.add_minion(&m).await.unwrap();

        let entry = store
            .record_completion(&m, MinionStatus::Completed, Some(100), None)
            .await
            .unwrap();
        assert_eq!(entry.pr_number, Some(100));
        assert!(entry.duration_seconds >= 0);

        assert!(store.get_active().await.unwrap().is_empty());
        let history = store.history(Some("o/r"), None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].minion_id, "minion-1");
        assert_eq!(history[0].status, MinionStatus::Completed);
    }

    #[tokio::test]
    async fn completion_is_idempotent_under_retry() {
        let (store, _dir) = store().await;
        let m = minion("minion-1", "o/r", 42);
        store.add_minion(&m).await.unwrap();

        store
            .record_completion(&m, MinionStatus::Failed, None, Some("boom"))
            .await
            .unwrap();
        let err = store
            .record_completion(&m, MinionStatus::Failed, None, Some("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyArchived(_)));

        // Only one history row was written.
        assert_eq!(store.history(None, None, 10).await.unwrap().len(), 1);
    }

    // ── history queries ────────────────────────────────────────────────────

    #[tokio::test]
    async fn history_filters_and_limits() {
        let (store, _dir) = store().await;
        for (i, repo) in [(1u64, "a/a"), (2, "a/a"), (3, "b/b")] {
            let m = minion(&format!("minion-{i}"), repo, i);
            store.add_minion(&m).await.unwrap();
            let status = if i == 2 {
                MinionStatus::Failed
            } else {
                MinionStatus::Completed
            };
            store.record_completion(&m, status, None, None).await.unwrap();
        }

        assert_eq!(store.history(None, None, 50).await.unwrap().len(), 3);
        assert_eq!(store.history(Some("a/a"), None, 50).await.unwrap().len(), 2);
        assert_eq!(
            store
                .history(Some("a/a"), Some(MinionStatus::Failed), 50)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.history(None, None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn history_is_reverse_chronological() {
        let (store, _dir) = store().await;
        for i in 1u64..=3 {
            let m = minion(&format!("minion-{i}"), "o/r", i);
            store.add_minion(&m).await.unwrap();
            store
                .record_completion(&m, MinionStatus::Completed, None, None)
                .await
                .unwrap();
            // Distinct completed_at values.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let history = store.history(None, None, 10).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|h| h.minion_id.as_str()).collect();
        assert_eq!(ids, vec!["minion-3", "minion-2", "minion-1"]);
    }

    #[tokio::test]
    async fn distinct_repos_sorted() {
        let (store, _dir) = store().await;
        for (i, repo) in [(1u64, "b/b"), (2, "a/a"), (3, "a/a")] {
            let m = minion(&format!("minion-{i}"), repo, i);
            store.add_minion(&m).await.unwrap();
            store
                .record_completion(&m, MinionStatus::Completed, None, None)
                .await
                .unwrap();
        }
        assert_eq!(store.distinct_repos().await.unwrap(), vec!["a/a", "b/b"]);
    }

    // ── evaluations ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn evaluations_round_trip() {
        let (store, _dir) = store().await;
        let eval = EvaluationRecord {
            pr_number: 100,
            repo: "o/r".to_string(),
            test_score: "pass".to_string(),
            lint_score: "pass".to_string(),
            review_score: "needs-work".to_string(),
            overall: "revise".to_string(),
            revision_number: 1,
            feedback: Some("tighten error handling".to_string()),
            evaluated_at: Utc::now(),
        };
        store.save_evaluation(&eval).await.unwrap();

        let loaded = store.evaluations("o/r", 100).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].overall, "revise");
        assert_eq!(loaded[0].feedback.as_deref(), Some("tighten error handling"));
        assert!(store.evaluations("o/r", 101).await.unwrap().is_empty());
    }

    // ── durability ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn active_rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = StateStore::open(&path).await.unwrap();
            store.add_minion(&minion("minion-1", "o/r", 42)).await.unwrap();
        }

        let store = StateStore::open(&path).await.unwrap();
        let active = store.get_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "minion-1");
    }
}
