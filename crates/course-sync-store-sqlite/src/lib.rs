use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use course_sync_core::{CourseStore, DuplicateIdNumber, LocalCourse, SyncError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

mod external;

pub use external::ExternalSource;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS course (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  full_name TEXT NOT NULL,
  short_name TEXT NOT NULL,
  id_number TEXT NOT NULL DEFAULT '',
  time_modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_course_id_number ON course(id_number);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewCourse {
    pub full_name: String,
    pub short_name: String,
    pub id_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub duplicate_id_numbers: Vec<DuplicateIdNumber>,
    pub courses_without_id_number: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open the local course store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "course")? {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            return Ok(1);
        }

        // A host-created course table without migration records is adopted as-is
        // as long as it carries the join key.
        if table_has_column(&self.conn, "course", "id_number")? {
            self.conn
                .execute_batch("CREATE INDEX IF NOT EXISTS idx_course_id_number ON course(id_number);")
                .context("failed to index existing course table")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: course table has no id_number column"))
    }

    /// Insert one local course. Used for administration and fixtures; a sync
    /// pass never creates courses.
    ///
    /// # Errors
    /// Returns an error when names are blank or the insert fails.
    pub fn add_course(&mut self, course: &NewCourse) -> Result<LocalCourse> {
        ensure_names(&course.full_name, &course.short_name)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO course(full_name, short_name, id_number, time_modified)
             VALUES (?1, ?2, ?3, ?4)",
            params![course.full_name, course.short_name, course.id_number, now_rfc3339()?],
        )
        .context("failed to insert course")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit course insert")?;

        Ok(LocalCourse {
            id,
            full_name: course.full_name.clone(),
            short_name: course.short_name.clone(),
            id_number: course.id_number.clone(),
        })
    }

    /// Load every local course ordered by primary key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_courses(&self) -> Result<Vec<LocalCourse>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, full_name, short_name, id_number FROM course ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_course)?;

        let mut courses = Vec::new();
        for row in rows {
            courses.push(row?);
        }
        Ok(courses)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_course(&self, id: i64) -> Result<Option<LocalCourse>> {
        self.conn
            .query_row(
                "SELECT id, full_name, short_name, id_number FROM course WHERE id = ?1",
                params![id],
                map_course,
            )
            .optional()
            .with_context(|| format!("failed to load course {id}"))
    }

    /// Find the course carrying `id_number`. When several share it, the lowest
    /// primary key wins.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_course_by_id_number(&self, id_number: &str) -> Result<Option<LocalCourse>> {
        self.conn
            .query_row(
                "SELECT id, full_name, short_name, id_number FROM course
                 WHERE id_number = ?1
                 ORDER BY id ASC
                 LIMIT 1",
                params![id_number],
                map_course,
            )
            .optional()
            .with_context(|| format!("failed to look up course by id_number {id_number}"))
    }

    /// Persist new names for an existing course and stamp `time_modified`.
    ///
    /// # Errors
    /// Returns an error when a name is blank, the course does not exist, or
    /// the write fails.
    pub fn update_course_names(&mut self, course: &LocalCourse) -> Result<()> {
        ensure_names(&course.full_name, &course.short_name)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let changed = tx
            .execute(
                "UPDATE course SET full_name = ?1, short_name = ?2, time_modified = ?3
                 WHERE id = ?4",
                params![course.full_name, course.short_name, now_rfc3339()?, course.id],
            )
            .with_context(|| format!("failed to update course {}", course.id))?;
        if changed != 1 {
            return Err(anyhow!("course {} does not exist", course.id));
        }
        tx.commit().context("failed to commit course update")?;
        debug!(course_id = course.id, "persisted course names");
        Ok(())
    }

    /// Identifiers carried by more than one course, with the sharing ids ascending.
    ///
    /// # Errors
    /// Returns an error when the scan fails.
    pub fn duplicate_id_numbers(&self) -> Result<Vec<DuplicateIdNumber>> {
        let mut stmt = self.conn.prepare(
            "SELECT id_number, id FROM course
             WHERE id_number <> '' AND id_number IN (
               SELECT id_number FROM course GROUP BY id_number HAVING COUNT(*) > 1
             )
             ORDER BY id_number ASC, id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            grouped.entry(row.get(0)?).or_default().push(row.get(1)?);
        }
        Ok(grouped
            .into_iter()
            .map(|(id_number, course_ids)| DuplicateIdNumber { id_number, course_ids })
            .collect())
    }

    /// Run quick-check, join-key health, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let (duplicate_id_numbers, courses_without_id_number) =
            if table_exists(&self.conn, "course")? {
                let blank = self
                    .conn
                    .query_row("SELECT COUNT(*) FROM course WHERE trim(id_number) = ''", [], |row| {
                        row.get::<_, i64>(0)
                    })
                    .context("failed to count courses without id_number")?;
                (self.duplicate_id_numbers()?, blank)
            } else {
                (Vec::new(), 0)
            };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            duplicate_id_numbers,
            courses_without_id_number,
            schema_status,
        })
    }
}

impl CourseStore for SqliteStore {
    fn find_by_id_number(&self, id_number: &str) -> Result<Option<LocalCourse>, SyncError> {
        self.find_course_by_id_number(id_number).map_err(|err| SyncError::Store(format!("{err:#}")))
    }

    fn update_names(&mut self, course: &LocalCourse) -> Result<(), SyncError> {
        self.update_course_names(course)
            .map_err(|err| SyncError::Update { course_id: course.id, message: format!("{err:#}") })
    }
}

fn ensure_names(full_name: &str, short_name: &str) -> Result<()> {
    if full_name.trim().is_empty() {
        return Err(anyhow!("full_name MUST be provided"));
    }
    if short_name.trim().is_empty() {
        return Err(anyhow!("short_name MUST be provided"));
    }
    Ok(())
}

fn map_course(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalCourse> {
    Ok(LocalCourse {
        id: row.get(0)?,
        full_name: row.get(1)?,
        short_name: row.get(2)?,
        id_number: row.get(3)?,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "course")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "course", "id_number")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: course table has no id_number column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
