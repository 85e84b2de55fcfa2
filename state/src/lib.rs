//! SQLite-backed result store.
//!
//! Every state transition is a conditional UPDATE gated on the current
//! status; mutators report whether a row was actually touched, and callers
//! treat `false` as "someone else already finalized this job". Terminal rows
//! are therefore immutable no matter how many reclaims race.

mod migrations;

use chrono::Utc;
use judge_protocol::ErrorKind;
use judge_protocol::JobKind;
use judge_protocol::JobStatus;
use judge_protocol::Profile;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to prepare results db directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to encode result json: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A job row as persisted. `result_json` stays a raw string; `{}` is a
/// legitimate sentinel and must round-trip verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub profile: String,
    pub problem_id: String,
    pub kind: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub attempts: i64,
    pub result_json: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    /// Open (and migrate) the job database, creating parent directories as
    /// needed.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(LevelFilter::Off);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrations::MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_job(
        &self,
        job_id: &str,
        problem_id: &str,
        profile: Profile,
        kind: JobKind,
        created_at: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            r#"
INSERT INTO jobs (id, status, profile, problem_id, kind, created_at)
VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Queued.as_str())
        .bind(profile.as_str())
        .bind(problem_id)
        .bind(kind.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `queued -> running`, or `running -> running` when a reclaim takes over
    /// a crashed attempt. Increments `attempts` either way.
    pub async fn mark_running(&self, job_id: &str) -> Result<bool, StateError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = ?, started_at = ?, attempts = attempts + 1
WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(JobStatus::Running.as_str())
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Queued.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_done(
        &self,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<bool, StateError> {
        let now = Utc::now().timestamp();
        let result_json = serde_json::to_string(result)?;
        let outcome = sqlx::query(
            r#"
UPDATE jobs
SET status = ?, finished_at = ?, result_json = ?, error = NULL, error_kind = NULL
WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Done.as_str())
        .bind(now)
        .bind(result_json)
        .bind(job_id)
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Terminal error transition, reachable from both `queued` (enqueue
    /// failures) and `running`.
    pub async fn mark_error(
        &self,
        job_id: &str,
        error: &str,
        result: Option<&serde_json::Value>,
        error_kind: ErrorKind,
    ) -> Result<bool, StateError> {
        let now = Utc::now().timestamp();
        let result_json = result.map(serde_json::to_string).transpose()?;
        let outcome = sqlx::query(
            r#"
UPDATE jobs
SET status = ?, finished_at = ?, result_json = ?, error = ?, error_kind = ?
WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(JobStatus::Error.as_str())
        .bind(now)
        .bind(result_json)
        .bind(error)
        .bind(error_kind.as_str())
        .bind(job_id)
        .bind(JobStatus::Queued.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRow>, StateError> {
        let row = sqlx::query(
            r#"
SELECT
    id,
    status,
    profile,
    problem_id,
    kind,
    created_at,
    started_at,
    finished_at,
    attempts,
    result_json,
    error,
    error_kind
FROM jobs
WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(JobRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            profile: row.try_get("profile")?,
            problem_id: row.try_get("problem_id")?,
            kind: row.try_get("kind")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            attempts: row.try_get("attempts")?,
            result_json: row.try_get("result_json")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
        }))
    }

    /// Row counts per status, for the scrape-time gauge.
    pub async fn count_by_status(&self) -> Result<HashMap<String, i64>, StateError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_protocol::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn open_store(dir: &tempfile::TempDir) -> ResultStore {
        ResultStore::open(&dir.path().join("judge.db")).await.unwrap()
    }

    async fn seeded(store: &ResultStore, job_id: &str) {
        store
            .create_job(job_id, "course/ch1/add", Profile::Light, JobKind::Submit, 1_700_000_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn happy_path_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;

        assert!(store.mark_running("job-1").await.unwrap());
        assert!(store.mark_done("job-1", &json!({"status": "Accepted"})).await.unwrap());

        let row = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(row.status, "done");
        assert_eq!(row.attempts, 1);
        assert_eq!(row.result_json.as_deref(), Some(r#"{"status":"Accepted"}"#));
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;

        assert!(store.mark_running("job-1").await.unwrap());
        assert!(store.mark_done("job-1", &json!({})).await.unwrap());

        // A late reclaim loses every race against the terminal row.
        assert!(!store.mark_running("job-1").await.unwrap());
        assert!(!store.mark_done("job-1", &json!({"late": true})).await.unwrap());
        assert!(
            !store
                .mark_error("job-1", "late error", None, ErrorKind::Internal)
                .await
                .unwrap()
        );

        let row = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(row.status, "done");
        assert_eq!(row.result_json.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn reclaim_increments_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;

        assert!(store.mark_running("job-1").await.unwrap());
        // A second worker reclaims the stale delivery mid-run.
        assert!(store.mark_running("job-1").await.unwrap());
        let row = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.status, "running");
    }

    #[tokio::test]
    async fn enqueue_failure_errors_a_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;

        assert!(
            store
                .mark_error("job-1", "Failed to enqueue job", None, ErrorKind::Internal)
                .await
                .unwrap()
        );
        let row = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.error_kind.as_deref(), Some("internal"));
        assert_eq!(row.result_json, None);
    }

    #[tokio::test]
    async fn error_with_result_preserves_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;
        store.mark_running("job-1").await.unwrap();

        let payload = json!({"status": "Time Limit Exceeded", "tests": []});
        assert!(
            store
                .mark_error("job-1", "Time Limit Exceeded (1s)", Some(&payload), ErrorKind::User)
                .await
                .unwrap()
        );
        let row = store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(row.error_kind.as_deref(), Some("user"));
        assert!(row.result_json.unwrap().contains("Time Limit Exceeded"));
    }

    #[tokio::test]
    async fn count_by_status_groups_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        seeded(&store, "job-1").await;
        seeded(&store, "job-2").await;
        store.mark_running("job-2").await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get("queued"), Some(&1));
        assert_eq!(counts.get("running"), Some(&1));
    }
}
