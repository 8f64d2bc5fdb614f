use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::HistoryError;
use crate::types::DrawRequest;

/// Record of submitted jobs, keyed by the remote job id.
///
/// Task units write to the ledger from their own tasks, so implementations
/// must serialize concurrent access themselves.
pub trait HistoryLedger: Send + Sync {
    /// Record a freshly submitted job.
    fn add_task(&self, job_id: &str, request: &DrawRequest) -> Result<(), HistoryError>;

    /// Record a job's terminal state.
    fn update_task(&self, job_id: &str, update: &HistoryUpdate) -> Result<(), HistoryError>;
}

/// Lifecycle of a ledger entry: Running -> Succeeded/Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Running,
    Succeeded,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            HistoryStatus::Running => "running",
            HistoryStatus::Succeeded => "succeeded",
            HistoryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(HistoryStatus::Running),
            "succeeded" => Some(HistoryStatus::Succeeded),
            "failed" => Some(HistoryStatus::Failed),
            _ => None,
        }
    }
}

/// Fields written when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryUpdate {
    pub status: HistoryStatus,
    pub result_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub preview_url: Option<String>,
}

impl HistoryUpdate {
    pub fn succeeded(result_path: PathBuf, preview_url: impl Into<String>) -> Self {
        Self {
            status: HistoryStatus::Succeeded,
            result_path: Some(result_path),
            failure_reason: None,
            error_message: None,
            preview_url: Some(preview_url.into()),
        }
    }

    pub fn failed(reason: impl Into<String>, error_message: Option<String>) -> Self {
        Self {
            status: HistoryStatus::Failed,
            result_path: None,
            failure_reason: Some(reason.into()),
            error_message,
            preview_url: None,
        }
    }
}

/// One row of the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    pub image_size: String,
    pub ref_images: Vec<String>,
    pub status: HistoryStatus,
    pub result_path: Option<String>,
    pub preview_url: Option<String>,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS draw_history (
    id              TEXT PRIMARY KEY,
    prompt          TEXT NOT NULL,
    model           TEXT NOT NULL,
    aspect_ratio    TEXT NOT NULL,
    image_size      TEXT NOT NULL,
    ref_images_json TEXT NOT NULL,
    status          TEXT CHECK(status IN ('running', 'succeeded', 'failed')),
    result_path     TEXT,
    preview_url     TEXT,
    failure_reason  TEXT,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_created ON draw_history(created_at);
"#;

const SELECT_COLUMNS: &str = "id, prompt, model, aspect_ratio, image_size, ref_images_json, status,
     result_path, preview_url, failure_reason, error_message, created_at, completed_at";

/// Open (or create) the history database. Pass `None` for an in-memory database.
pub fn open_database(path: Option<&Path>) -> anyhow::Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p).context("Failed to open history database")?,
        None => Connection::open_in_memory().context("Failed to open in-memory database")?,
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("Failed to set PRAGMA options")?;

    conn.execute_batch(SCHEMA)
        .context("Failed to create history schema")?;

    Ok(conn)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(HistoryEntry, String)> {
    let status: String = row.get(6)?;
    let refs_json: String = row.get(5)?;
    Ok((
        HistoryEntry {
            id: row.get(0)?,
            prompt: row.get(1)?,
            model: row.get(2)?,
            aspect_ratio: row.get(3)?,
            image_size: row.get(4)?,
            ref_images: Vec::new(),
            status: HistoryStatus::parse(&status).unwrap_or(HistoryStatus::Failed),
            result_path: row.get(7)?,
            preview_url: row.get(8)?,
            failure_reason: row.get(9)?,
            error_message: row.get(10)?,
            created_at: row.get(11)?,
            completed_at: row.get(12)?,
        },
        refs_json,
    ))
}

fn finish_entry((mut entry, refs_json): (HistoryEntry, String)) -> Result<HistoryEntry, HistoryError> {
    entry.ref_images = serde_json::from_str(&refs_json)?;
    Ok(entry)
}

/// SQLite-backed [`HistoryLedger`].
///
/// A single connection behind a mutex; every call holds the lock only for
/// the duration of one statement.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open the ledger at `path`, or in memory when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self, HistoryError> {
        let conn = open_database(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::open(None)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, HistoryError> {
        self.conn
            .lock()
            .map_err(|e| HistoryError::Other(format!("History mutex poisoned: {}", e)))
    }

    /// Get a single entry by job id.
    pub fn get(&self, job_id: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM draw_history WHERE id = ?1", SELECT_COLUMNS);
        let row = conn
            .query_row(&sql, params![job_id], entry_from_row)
            .optional()?;
        row.map(finish_entry).transpose()
    }

    /// Most recent entries first, at most `limit` of them.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM draw_history ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(finish_entry(row?)?);
        }
        Ok(entries)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, job_id: &str) -> Result<bool, HistoryError> {
        let conn = self.lock()?;
        let count = conn.execute("DELETE FROM draw_history WHERE id = ?1", params![job_id])?;
        Ok(count > 0)
    }

    /// Delete finished entries completed more than `days` days ago.
    /// Returns the number of entries deleted.
    pub fn prune(&self, days: u32) -> Result<u32, HistoryError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let conn = self.lock()?;
        let count = conn
            .execute(
                "DELETE FROM draw_history
                 WHERE status IN ('succeeded', 'failed')
                 AND completed_at < ?1",
                params![cutoff],
            )
            .context("Failed to prune history")?;
        Ok(count as u32)
    }
}

impl HistoryLedger for SqliteLedger {
    fn add_task(&self, job_id: &str, request: &DrawRequest) -> Result<(), HistoryError> {
        let refs_json = serde_json::to_string(&request.ref_images)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO draw_history
                (id, prompt, model, aspect_ratio, image_size, ref_images_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7)",
            params![
                job_id,
                request.prompt,
                request.model,
                request.aspect_ratio,
                request.image_size,
                refs_json,
                now
            ],
        )
        .context("Failed to insert history entry")?;
        Ok(())
    }

    fn update_task(&self, job_id: &str, update: &HistoryUpdate) -> Result<(), HistoryError> {
        let now = chrono::Utc::now().to_rfc3339();
        let result_path = update
            .result_path
            .as_ref()
            .map(|p| p.display().to_string());
        let conn = self.lock()?;
        let count = conn
            .execute(
                "UPDATE draw_history
                 SET status = ?1, result_path = ?2, failure_reason = ?3,
                     error_message = ?4, preview_url = ?5, completed_at = ?6
                 WHERE id = ?7",
                params![
                    update.status.as_str(),
                    result_path,
                    update.failure_reason,
                    update.error_message,
                    update.preview_url,
                    now,
                    job_id
                ],
            )
            .context("Failed to update history entry")?;

        if count == 0 {
            return Err(HistoryError::NotFound(job_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> SqliteLedger {
        SqliteLedger::in_memory().unwrap()
    }

    fn request() -> DrawRequest {
        DrawRequest::new("a fox", "nano-banana-fast")
            .aspect_ratio("16:9")
            .reference_image("https://x/ref.png")
    }

    #[test]
    fn test_add_and_get() {
        let ledger = setup();
        ledger.add_task("job-1", &request()).unwrap();

        let entry = ledger.get("job-1").unwrap().unwrap();
        assert_eq!(entry.prompt, "a fox");
        assert_eq!(entry.aspect_ratio, "16:9");
        assert_eq!(entry.ref_images, vec!["https://x/ref.png".to_string()]);
        assert_eq!(entry.status, HistoryStatus::Running);
        assert!(entry.completed_at.is_none());
    }

    #[test]
    fn test_update_succeeded() {
        let ledger = setup();
        ledger.add_task("job-1", &request()).unwrap();
        ledger
            .update_task(
                "job-1",
                &HistoryUpdate::succeeded(PathBuf::from("out/a.png"), "https://x/a.png"),
            )
            .unwrap();

        let entry = ledger.get("job-1").unwrap().unwrap();
        assert_eq!(entry.status, HistoryStatus::Succeeded);
        assert_eq!(entry.result_path.as_deref(), Some("out/a.png"));
        assert_eq!(entry.preview_url.as_deref(), Some("https://x/a.png"));
        assert!(entry.completed_at.is_some());
    }

    #[test]
    fn test_update_failed() {
        let ledger = setup();
        ledger.add_task("job-1", &request()).unwrap();
        ledger
            .update_task(
                "job-1",
                &HistoryUpdate::failed("content_policy", Some("flagged".into())),
            )
            .unwrap();

        let entry = ledger.get("job-1").unwrap().unwrap();
        assert_eq!(entry.status, HistoryStatus::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("content_policy"));
        assert_eq!(entry.error_message.as_deref(), Some("flagged"));
    }

    #[test]
    fn test_update_unknown_job() {
        let ledger = setup();
        let result = ledger.update_task("nope", &HistoryUpdate::failed("x", None));
        assert!(matches!(result, Err(HistoryError::NotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_list_newest_first() {
        let ledger = setup();
        ledger.add_task("a", &request()).unwrap();
        ledger.add_task("b", &request()).unwrap();
        ledger.add_task("c", &request()).unwrap();

        let entries = ledger.list(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "c");
        assert_eq!(entries[1].id, "b");
    }

    #[test]
    fn test_delete() {
        let ledger = setup();
        ledger.add_task("job-1", &request()).unwrap();
        assert!(ledger.delete("job-1").unwrap());
        assert!(!ledger.delete("job-1").unwrap());
        assert!(ledger.get("job-1").unwrap().is_none());
    }

    #[test]
    fn test_prune_old_entries() {
        let ledger = setup();
        ledger.add_task("job-1", &request()).unwrap();
        ledger
            .update_task("job-1", &HistoryUpdate::failed("x", None))
            .unwrap();

        assert_eq!(ledger.prune(30).unwrap(), 0);

        let old_date = (chrono::Utc::now() - chrono::Duration::days(10)).to_rfc3339();
        ledger
            .lock()
            .unwrap()
            .execute(
                "UPDATE draw_history SET completed_at = ?1 WHERE id = 'job-1'",
                params![old_date],
            )
            .unwrap();

        assert_eq!(ledger.prune(5).unwrap(), 1);
    }

    #[test]
    fn test_persistence_across_instances() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("history.db");

        {
            let ledger = SqliteLedger::open(Some(&db_path)).unwrap();
            ledger.add_task("p1", &request()).unwrap();
        }

        let ledger = SqliteLedger::open(Some(&db_path)).unwrap();
        assert!(ledger.get("p1").unwrap().is_some());
    }
}
