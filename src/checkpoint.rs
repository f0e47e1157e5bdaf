//! SQLite snapshot of finished external calls so an interrupted run can resume
//! without repeating them. Failures are kept per run for auditing only.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::records::{FailureRecord, Stage};
use crate::wiki::{QualityLabel, RevisionId};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode raw response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("revision id {0} does not fit in the checkpoint")]
    RevisionOutOfRange(RevisionId),
}

pub struct Checkpoint {
    conn: Connection,
}

#[derive(Debug, Default, PartialEq)]
pub struct CheckpointStats {
    pub revisions: i64,
    pub qualities: i64,
    pub latest_run: Option<String>,
    pub failures_by_stage: Vec<(String, i64)>,
}

fn to_sql_id(revision_id: RevisionId) -> Result<i64, CheckpointError> {
    i64::try_from(revision_id).map_err(|_| CheckpointError::RevisionOutOfRange(revision_id))
}

impl Checkpoint {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let checkpoint = Checkpoint { conn };
        checkpoint.init_schema()?;
        Ok(checkpoint)
    }

    pub fn in_memory() -> Result<Self, CheckpointError> {
        let checkpoint = Checkpoint {
            conn: Connection::open_in_memory()?,
        };
        checkpoint.init_schema()?;
        Ok(checkpoint)
    }

    fn init_schema(&self) -> Result<(), CheckpointError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS revisions (
                title       TEXT PRIMARY KEY,
                revision_id INTEGER NOT NULL,
                fetched_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS qualities (
                revision_id INTEGER PRIMARY KEY,
                label       TEXT NOT NULL,
                fetched_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS runs (
                id         INTEGER PRIMARY KEY,
                run_id     TEXT NOT NULL UNIQUE,
                started_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS failures (
                id           INTEGER PRIMARY KEY,
                run_id       TEXT NOT NULL,
                name         TEXT NOT NULL,
                url          TEXT NOT NULL,
                country      TEXT NOT NULL,
                stage        TEXT NOT NULL,
                error        TEXT NOT NULL,
                raw_response TEXT,
                recorded_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_failures_run ON failures(run_id);
            ",
        )?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CheckpointError> {
        self.conn
            .execute_batch("DELETE FROM revisions; DELETE FROM qualities; DELETE FROM failures; DELETE FROM runs;")?;
        Ok(())
    }

    pub fn revision_for(&self, title: &str) -> Result<Option<RevisionId>, CheckpointError> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT revision_id FROM revisions WHERE title = ?1",
                params![title],
                |row| row.get(0),
            )
            .optional()?;
        // rows are only ever written from positive ids
        Ok(id.and_then(|id| RevisionId::try_from(id).ok()))
    }

    pub fn save_revision(&self, title: &str, revision_id: RevisionId) -> Result<(), CheckpointError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO revisions (title, revision_id) VALUES (?1, ?2)",
            params![title, to_sql_id(revision_id)?],
        )?;
        Ok(())
    }

    pub fn quality_for(&self, revision_id: RevisionId) -> Result<Option<QualityLabel>, CheckpointError> {
        let label: Option<String> = self
            .conn
            .query_row(
                "SELECT label FROM qualities WHERE revision_id = ?1",
                params![to_sql_id(revision_id)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(label.map(QualityLabel::new))
    }

    pub fn save_quality(&self, revision_id: RevisionId, label: &QualityLabel) -> Result<(), CheckpointError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO qualities (revision_id, label) VALUES (?1, ?2)",
            params![to_sql_id(revision_id)?, label.as_str()],
        )?;
        Ok(())
    }

    /// Register `run_id` as the latest run. Registering it again is a no-op.
    pub fn begin_run(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO runs (run_id) VALUES (?1)",
            params![run_id],
        )?;
        Ok(())
    }

    pub fn record_failure(&self, run_id: &str, failure: &FailureRecord) -> Result<(), CheckpointError> {
        self.begin_run(run_id)?;
        let raw = failure
            .raw_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO failures (run_id, name, url, country, stage, error, raw_response)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                failure.politician.name,
                failure.politician.url,
                failure.politician.country,
                failure.stage.as_str(),
                failure.error,
                raw,
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CheckpointStats, CheckpointError> {
        let revisions = self
            .conn
            .query_row("SELECT COUNT(*) FROM revisions", [], |row| row.get(0))?;
        let qualities = self
            .conn
            .query_row("SELECT COUNT(*) FROM qualities", [], |row| row.get(0))?;
        let latest_run: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let mut failures_by_stage = Vec::new();
        if let Some(run_id) = &latest_run {
            let mut stmt = self.conn.prepare(
                "SELECT stage, COUNT(*) FROM failures WHERE run_id = ?1 GROUP BY stage",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                failures_by_stage.push(row?);
            }
            // pipeline order rather than alphabetical
            failures_by_stage.sort_by_key(|(stage, _)| Stage::parse(stage));
        }

        Ok(CheckpointStats {
            revisions,
            qualities,
            latest_run,
            failures_by_stage,
        })
    }
}
