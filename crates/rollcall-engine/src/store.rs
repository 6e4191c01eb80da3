//! Durable identity store: LabelMap, samples and the serialized model.
//!
//! Backed by SQLite. Every mutation runs in a single transaction under the
//! store lock and bumps the persisted generation counter before commit; the
//! new generation is published to an in-memory atomic while the lock is
//! still held, so a recognizer reading `generation()` never sees a counter
//! ahead of the data.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rollcall_core::{Label, LabelMap, ModelBlob, NewSample, Patch, Sample, SamplingPolicy, View};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const SCHEMA_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    WriteFailure(#[source] rusqlite::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown label {0}")]
    UnknownLabel(Label),
    #[error("corrupt store row: {0}")]
    Corrupt(String),
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("patch size mismatch: store holds {expected}x{expected} samples, got {actual}x{actual}")]
    PatchSizeMismatch { expected: u32, actual: u32 },
}

impl StoreError {
    /// Reclassify raw SQLite errors raised inside a write as write failures.
    fn in_write(self) -> Self {
        match self {
            StoreError::Sql(e) => StoreError::WriteFailure(e),
            other => other,
        }
    }
}

/// Immutable view of everything needed to train a model.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub labels: LabelMap,
    /// Ordered by label, then insertion.
    pub samples: Vec<Sample>,
}

/// One enrolled person, for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonRecord {
    pub person_id: String,
    pub label: Label,
    pub created_at: DateTime<Utc>,
    pub samples: usize,
}

/// A model blob together with the generation it was trained at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredModel {
    pub generation: u64,
    pub blob: ModelBlob,
}

pub struct IdentityStore {
    conn: Mutex<Connection>,
    generation: AtomicU64,
}

impl IdentityStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), generation = store.generation(), "identity store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // Acknowledge a write only once it is on disk.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        let generation = meta_get(&conn, "generation")?.unwrap_or(0) as u64;
        Ok(Self {
            conn: Mutex::new(conn),
            generation: AtomicU64::new(generation),
        })
    }

    /// Current generation. Increments on every enrollment write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn label_of(&self, person_id: &str) -> Result<Option<Label>, StoreError> {
        let conn = self.conn.lock();
        lookup_label(&conn, person_id)
    }

    /// Edge length of every stored sample, fixed by the first append and
    /// released again once the last sample is removed.
    pub fn patch_size(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.conn.lock();
        Ok(meta_get(&conn, "patch_size")?.map(|size| size as u32))
    }

    /// Return the person's label, minting the next unused one on first sight.
    pub fn ensure_label(&self, person_id: &str) -> Result<Label, StoreError> {
        let mut conn = self.conn.lock();
        if let Some(label) = lookup_label(&conn, person_id)? {
            return Ok(label);
        }

        let tx = conn.transaction().map_err(StoreError::WriteFailure)?;
        let label = mint_label(&tx, person_id).map_err(StoreError::in_write)?;
        let generation = self.commit_mutation(tx)?;

        tracing::info!(person_id, label, generation, "label assigned");
        Ok(label)
    }

    /// Append the samples `policy` keeps, all or nothing. Returns how many
    /// were stored; samples past the cap are dropped silently.
    pub fn append_samples(
        &self,
        label: Label,
        samples: &[NewSample],
        policy: &SamplingPolicy,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM persons WHERE label = ?1", [label], |r| r.get(0))
            .optional()?;
        if known.is_none() {
            return Err(StoreError::UnknownLabel(label));
        }

        let kept = policy.select(samples.iter());
        if kept.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction().map_err(StoreError::WriteFailure)?;
        insert_samples(&tx, label, &kept).map_err(StoreError::in_write)?;
        let generation = self.commit_mutation(tx)?;

        tracing::info!(
            label,
            offered = samples.len(),
            stored = kept.len(),
            generation,
            "samples appended"
        );
        Ok(kept.len())
    }

    /// `ensure_label` followed by `append_samples` as one transaction, so a
    /// concurrent `remove_person` lands either before or after it, never
    /// between the two. Returns the label and how many samples were stored.
    pub fn enroll(
        &self,
        person_id: &str,
        samples: &[NewSample],
        policy: &SamplingPolicy,
    ) -> Result<(Label, usize), StoreError> {
        let mut conn = self.conn.lock();
        let existing = lookup_label(&conn, person_id)?;
        let kept = policy.select(samples.iter());
        if let (Some(label), true) = (existing, kept.is_empty()) {
            return Ok((label, 0));
        }

        let tx = conn.transaction().map_err(StoreError::WriteFailure)?;
        let label = (|| -> Result<Label, StoreError> {
            let label = match existing {
                Some(label) => label,
                None => mint_label(&tx, person_id)?,
            };
            if !kept.is_empty() {
                insert_samples(&tx, label, &kept)?;
            }
            Ok(label)
        })()
        .map_err(StoreError::in_write)?;
        let generation = self.commit_mutation(tx)?;

        tracing::info!(
            person_id,
            label,
            minted = existing.is_none(),
            offered = samples.len(),
            stored = kept.len(),
            generation,
            "person enrolled"
        );
        Ok((label, kept.len()))
    }

    /// Delete a person and their samples, tombstoning the label so it is
    /// never minted again.
    pub fn remove_person(&self, person_id: &str) -> Result<Option<Label>, StoreError> {
        let mut conn = self.conn.lock();
        let Some(label) = lookup_label(&conn, person_id)? else {
            return Ok(None);
        };

        let tx = conn.transaction().map_err(StoreError::WriteFailure)?;
        (|| -> Result<(), StoreError> {
            tx.execute("DELETE FROM samples WHERE label = ?1", [label])?;
            tx.execute("DELETE FROM persons WHERE label = ?1", [label])?;
            tx.execute(
                "INSERT OR REPLACE INTO tombstones (label, person_id, removed_at) VALUES (?1, ?2, ?3)",
                params![label, person_id, Utc::now().to_rfc3339()],
            )?;
            let remaining: i64 = tx.query_row("SELECT COUNT(*) FROM samples", [], |r| r.get(0))?;
            if remaining == 0 {
                tx.execute("DELETE FROM meta WHERE key = 'patch_size'", [])?;
            }
            Ok(())
        })()
        .map_err(StoreError::in_write)?;
        let generation = self.commit_mutation(tx)?;

        tracing::info!(person_id, label, generation, "person removed");
        Ok(Some(label))
    }

    pub fn label_map(&self) -> Result<LabelMap, StoreError> {
        let conn = self.conn.lock();
        read_label_map(&conn)
    }

    /// Consistent view of generation, LabelMap and all samples.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn.lock();
        let generation = self.generation();
        let labels = read_label_map(&conn)?;

        let mut stmt = conn.prepare("SELECT label, view, size, data FROM samples ORDER BY label, id")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, Label>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (label, view, size, data) = row?;
            let view: View = view.parse().map_err(StoreError::Corrupt)?;
            let patch = Patch::new(data, size)
                .map_err(|e| StoreError::Corrupt(format!("sample for label {label}: {e}")))?;
            samples.push(Sample { label, view, patch });
        }

        Ok(Snapshot {
            generation,
            labels,
            samples,
        })
    }

    /// Enrolled persons with their sample counts, ordered by label.
    pub fn persons(&self) -> Result<Vec<PersonRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT p.person_id, p.label, p.created_at, COUNT(s.id)
             FROM persons p LEFT JOIN samples s ON s.label = p.label
             GROUP BY p.label ORDER BY p.label",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Label>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?;

        let mut persons = Vec::new();
        for row in rows {
            let (person_id, label, created_at, samples) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::Corrupt(format!("created_at for {person_id}: {e}")))?
                .with_timezone(&Utc);
            persons.push(PersonRecord {
                person_id,
                label,
                created_at,
                samples: samples as usize,
            });
        }
        Ok(persons)
    }

    /// Persist a trained model blob. Does not change the generation.
    pub fn save_model(&self, generation: u64, blob: &ModelBlob) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO model (id, generation, header, histograms, digest, trained_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                generation as i64,
                blob.header,
                blob.histograms,
                blob.digest,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(StoreError::WriteFailure)?;
        Ok(())
    }

    pub fn load_model(&self) -> Result<Option<StoredModel>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT generation, header, histograms, digest FROM model WHERE id = 1",
                [],
                |r| {
                    Ok(StoredModel {
                        generation: r.get::<_, i64>(0)? as u64,
                        blob: ModelBlob {
                            header: r.get(1)?,
                            histograms: r.get(2)?,
                            digest: r.get(3)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Bump the generation, commit, then publish the new generation.
    fn commit_mutation(&self, tx: Transaction<'_>) -> Result<u64, StoreError> {
        let generation = meta_get(&tx, "generation")
            .map_err(StoreError::in_write)?
            .unwrap_or(0)
            + 1;
        meta_set(&tx, "generation", generation).map_err(StoreError::in_write)?;
        tx.commit().map_err(StoreError::WriteFailure)?;
        self.generation.store(generation as u64, Ordering::Release);
        Ok(generation as u64)
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(sql, [])?)
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );",
    )?;

    let found = meta_get(conn, "schema_version")?.unwrap_or(0);
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS persons (
            person_id TEXT PRIMARY KEY,
            label INTEGER NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tombstones (
            label INTEGER PRIMARY KEY,
            person_id TEXT NOT NULL,
            removed_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label INTEGER NOT NULL REFERENCES persons(label) ON DELETE CASCADE,
            view TEXT NOT NULL,
            size INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS samples_label_idx ON samples(label, id);
        CREATE TABLE IF NOT EXISTS model (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            generation INTEGER NOT NULL,
            header TEXT NOT NULL,
            histograms BLOB NOT NULL,
            digest BLOB NOT NULL,
            trained_at TEXT NOT NULL
        );
        INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', 1);
        COMMIT;",
    )?;
    tracing::info!(from = found, to = SCHEMA_VERSION, "identity store schema migrated");
    Ok(())
}

fn meta_get(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
        .optional()?)
}

fn meta_set(conn: &Connection, key: &str, value: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn mint_label(tx: &Transaction<'_>, person_id: &str) -> Result<Label, StoreError> {
    let next = meta_get(tx, "next_label")?.unwrap_or(0);
    tx.execute(
        "INSERT INTO persons (person_id, label, created_at) VALUES (?1, ?2, ?3)",
        params![person_id, next, Utc::now().to_rfc3339()],
    )?;
    meta_set(tx, "next_label", next + 1)?;
    Ok(next as Label)
}

/// Insert `kept` for `label`. Every sample must match the store's patch
/// size; the first insert into an empty store records it.
fn insert_samples(tx: &Transaction<'_>, label: Label, kept: &[&NewSample]) -> Result<(), StoreError> {
    let Some(first) = kept.first() else {
        return Ok(());
    };
    let expected = match meta_get(tx, "patch_size")? {
        Some(size) => size as u32,
        None => {
            meta_set(tx, "patch_size", i64::from(first.patch.size))?;
            first.patch.size
        }
    };
    if let Some(odd) = kept.iter().find(|s| s.patch.size != expected) {
        return Err(StoreError::PatchSizeMismatch {
            expected,
            actual: odd.patch.size,
        });
    }

    let now = Utc::now().to_rfc3339();
    let mut insert = tx.prepare(
        "INSERT INTO samples (label, view, size, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for sample in kept {
        insert.execute(params![
            label,
            sample.view.as_str(),
            sample.patch.size,
            sample.patch.data,
            now
        ])?;
    }
    Ok(())
}

fn lookup_label(conn: &Connection, person_id: &str) -> Result<Option<Label>, StoreError> {
    Ok(conn
        .query_row("SELECT label FROM persons WHERE person_id = ?1", [person_id], |r| r.get(0))
        .optional()?)
}

fn read_label_map(conn: &Connection) -> Result<LabelMap, StoreError> {
    let mut stmt = conn.prepare("SELECT person_id, label FROM persons ORDER BY label")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Label>(1)?)))?;
    let mut map = LabelMap::new();
    for row in rows {
        let (person_id, label) = row?;
        map.insert(person_id, label);
    }
    Ok(map)
}
