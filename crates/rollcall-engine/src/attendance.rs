//! Attendance log: first sighting of each person per local day.

use crate::store::StoreError;
use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEntry {
    pub person_id: String,
    pub day: NaiveDate,
    pub first_seen: DateTime<Local>,
}

/// Lives in the identity database file but on its own connection, so
/// check-ins never wait behind enrollment writes for long.
pub struct AttendanceLog {
    conn: Mutex<Connection>,
}

impl AttendanceLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance (
                person_id TEXT NOT NULL,
                day TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                PRIMARY KEY (person_id, day)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a sighting. Returns `true` if this is the person's first
    /// sighting on `at`'s day; later sightings leave the entry untouched.
    pub fn record(&self, person_id: &str, at: DateTime<Local>) -> Result<bool, StoreError> {
        let day = at.date_naive();
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO attendance (person_id, day, first_seen) VALUES (?1, ?2, ?3)",
                params![person_id, day.to_string(), at.to_rfc3339()],
            )
            .map_err(StoreError::WriteFailure)?;
        if inserted > 0 {
            tracing::info!(person_id, %day, "attendance recorded");
        } else {
            tracing::debug!(person_id, %day, "already checked in");
        }
        Ok(inserted > 0)
    }

    /// Entries for `day`, earliest first.
    pub fn on(&self, day: NaiveDate) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT person_id, first_seen FROM attendance WHERE day = ?1 ORDER BY first_seen, person_id",
        )?;
        let rows = stmt.query_map([day.to_string()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (person_id, first_seen) = row?;
            let first_seen = DateTime::parse_from_rfc3339(&first_seen)
                .map_err(|e| StoreError::Corrupt(format!("first_seen for {person_id}: {e}")))?
                .with_timezone(&Local);
            entries.push(AttendanceEntry {
                person_id,
                day,
                first_seen,
            });
        }
        Ok(entries)
    }
}
