//! SQLite-based session storage and statistics.
//!
//! Provides persistent storage for:
//! - Completed breathing sessions with their per-round apnea times
//! - Session statistics (daily and all-time)
//! - Key-value store for application state (per-student progress)

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::data_dir;
use crate::error::{DatabaseError, Result};
use crate::metrics::{ProgressStats, ProgressStore, SessionSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub session_id: String,
    pub student_id: String,
    pub completed_rounds: u32,
    pub planned_rounds: u32,
    pub breaths_per_cycle: u32,
    pub apnea_by_round: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_sessions: u64,
    pub total_breaths: u64,
    pub total_rounds: u64,
    pub best_apnea_secs: u32,
    pub today_sessions: u64,
}

/// SQLite database for session storage.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `~/.config/apneaflow/apneaflow.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        Self::open_at(&data_dir()?.join("apneaflow.db"))
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::from)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> std::result::Result<(), DatabaseError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id        TEXT NOT NULL,
                student_id        TEXT NOT NULL DEFAULT '',
                completed_rounds  INTEGER NOT NULL,
                planned_rounds    INTEGER NOT NULL,
                breaths_per_cycle INTEGER NOT NULL,
                apnea_by_round    TEXT NOT NULL DEFAULT '[]',
                started_at        TEXT NOT NULL,
                completed_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_completed_at ON sessions(completed_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_student ON sessions(student_id, completed_at);",
        )?;
        Ok(())
    }

    /// Record a completed session to the database.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn record_session(&self, student_id: &str, summary: &SessionSummary) -> Result<i64> {
        let rounds = serde_json::to_string(&summary.apnea_by_round)?;
        self.conn
            .execute(
                "INSERT INTO sessions (session_id, student_id, completed_rounds, planned_rounds,
                                       breaths_per_cycle, apnea_by_round, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    summary.session_id,
                    student_id,
                    summary.completed_rounds,
                    summary.planned_rounds,
                    summary.breaths_per_cycle,
                    rounds,
                    summary.started_at.to_rfc3339(),
                    summary.completed_at.to_rfc3339(),
                ],
            )
            .map_err(DatabaseError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent sessions first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, student_id, completed_rounds, planned_rounds,
                        breaths_per_cycle, apnea_by_round, started_at, completed_at
                 FROM sessions
                 ORDER BY completed_at DESC, id DESC
                 LIMIT ?1",
            )
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(DatabaseError::from)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session_id, student_id, completed, planned, breaths, rounds, started, completed_at) =
                row.map_err(DatabaseError::from)?;
            records.push(SessionRecord {
                id,
                session_id,
                student_id,
                completed_rounds: completed,
                planned_rounds: planned,
                breaths_per_cycle: breaths,
                apnea_by_round: decode_rounds(id, &rounds)?,
                started_at: parse_timestamp(id, &started)?,
                completed_at: parse_timestamp(id, &completed_at)?,
            });
        }
        Ok(records)
    }

    pub fn stats_all(&self) -> Result<Stats> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, completed_rounds, planned_rounds, breaths_per_cycle, apnea_by_round, completed_at
                 FROM sessions",
            )
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(DatabaseError::from)?;

        let today = Utc::now().date_naive();
        let mut stats = Stats::default();
        for row in rows {
            let (id, completed, planned, breaths, rounds, completed_at) =
                row.map_err(DatabaseError::from)?;
            stats.total_sessions += 1;
            stats.total_rounds += completed;
            stats.total_breaths += breaths * planned;
            if let Some(best) = decode_rounds(id, &rounds)?.into_iter().max() {
                stats.best_apnea_secs = stats.best_apnea_secs.max(best);
            }
            if parse_timestamp(id, &completed_at)?.date_naive() == today {
                stats.today_sessions += 1;
            }
        }
        Ok(stats)
    }

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .map_err(DatabaseError::from)?;
        let result = stmt.query_row(params![key], |row| row.get::<_, String>(0));
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::from(e).into()),
        }
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(DatabaseError::from)?;
        Ok(())
    }
}

fn decode_rounds(id: i64, raw: &str) -> std::result::Result<Vec<u32>, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt {
        key: format!("sessions/{id}/apnea_by_round"),
        message: e.to_string(),
    })
}

fn parse_timestamp(id: i64, raw: &str) -> std::result::Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            key: format!("sessions/{id}/timestamp"),
            message: e.to_string(),
        })
}

/// [`ProgressStore`] backed by the kv table, one JSON document per student.
pub struct SqliteProgressStore {
    db: Database,
}

impl SqliteProgressStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn kv_key(key: &str) -> String {
        format!("progress:{key}")
    }
}

impl ProgressStore for SqliteProgressStore {
    fn load(&self, key: &str) -> Result<ProgressStats> {
        let kv_key = Self::kv_key(key);
        match self.db.kv_get(&kv_key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                DatabaseError::Corrupt {
                    key: kv_key,
                    message: e.to_string(),
                }
                .into()
            }),
            None => Ok(ProgressStats::default()),
        }
    }

    fn save(&mut self, key: &str, stats: &ProgressStats) -> Result<()> {
        let raw = serde_json::to_string(stats)?;
        self.db.kv_set(&Self::kv_key(key), &raw)
    }
}
