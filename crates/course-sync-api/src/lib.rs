use std::path::PathBuf;

use anyhow::Result;
use course_sync_core::{
    external_course_lookup_query, read_external_courses, records_from_rows, run_reconciliation,
    CourseSource, ErrorPolicy, ExternalCourseRecord, LocalCourse, OutcomeCounts,
    ReconciliationOutcome, ReconciliationRun, SyncConfig, SyncError, ValidatedConfig,
};
use course_sync_store_sqlite::{ExternalSource, IntegrityReport, NewCourse, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Skipped,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl PassStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowReport {
    /// 1-based position in source order.
    pub sequence: usize,
    pub record: ExternalCourseRecord,
    pub outcome: Option<ReconciliationOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassReport {
    pub run_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub status: PassStatus,
    pub exit_code: u8,
    pub message: String,
    pub error_kind: Option<String>,
    pub error_policy: ErrorPolicy,
    /// Digest of the normalized external records; equal digests mean equal input.
    pub source_digest: Option<String>,
    pub counts: OutcomeCounts,
    pub rows: Vec<RowReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

struct PassContext {
    run_id: Ulid,
    started_at: OffsetDateTime,
    policy: ErrorPolicy,
}

impl PassContext {
    fn start(policy: ErrorPolicy) -> Self {
        let context = Self { run_id: Ulid::new(), started_at: OffsetDateTime::now_utc(), policy };
        info!(run_id = %context.run_id, policy = policy.as_str(), "starting course name synchronisation");
        context
    }

    fn skipped(self, err: &SyncError) -> PassReport {
        info!(run_id = %self.run_id, reason = %err, "course name synchronisation skipped");
        self.finish(PassStatus::Skipped, format!("course name synchronisation skipped: {err}"), None, None, None)
    }

    fn failed(self, err: &SyncError, run: Option<ReconciliationRun>, digest: Option<String>) -> PassReport {
        warn!(run_id = %self.run_id, kind = err.kind(), error = %err, "course name synchronisation failed");
        self.finish(PassStatus::Failed, err.to_string(), Some(err), run, digest)
    }

    fn finish(
        self,
        status: PassStatus,
        message: String,
        err: Option<&SyncError>,
        run: Option<ReconciliationRun>,
        source_digest: Option<String>,
    ) -> PassReport {
        let (rows, counts) = match run {
            Some(run) => (row_reports(run.rows), run.counts),
            None => (Vec::new(), OutcomeCounts::default()),
        };
        let exit_code = match (status, err) {
            (_, Some(err)) => err.exit_code(),
            (PassStatus::CompletedWithErrors, None) => 5,
            _ => 0,
        };

        PassReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: OffsetDateTime::now_utc(),
            status,
            exit_code,
            message,
            error_kind: err.map(|err| err.kind().to_string()),
            error_policy: self.policy,
            source_digest,
            counts,
            rows,
        }
    }
}

impl PassReport {
    /// Report for a pass that could not start because its configuration was
    /// unreadable. A `NotConfigured` error still reports as skipped.
    #[must_use]
    pub fn rejected(err: &SyncError, policy: ErrorPolicy) -> Self {
        let context = PassContext::start(policy);
        match err {
            SyncError::NotConfigured(_) => context.skipped(err),
            _ => context.failed(err, None, None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CourseSyncApi {
    db_path: PathBuf,
}

impl CourseSyncApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Run one reconciliation pass.
    ///
    /// Source-side failures are reported inside the returned [`PassReport`]; the
    /// outer error is reserved for the local store being unusable.
    ///
    /// # Errors
    /// Returns an error when the local course store cannot be opened or migrated.
    pub fn run_pass(&self, config: &SyncConfig, policy: ErrorPolicy) -> Result<PassReport> {
        let context = PassContext::start(policy);

        let validated = match config.validate() {
            Ok(validated) => validated,
            Err(err @ SyncError::NotConfigured(_)) => return Ok(context.skipped(&err)),
            Err(err) => return Ok(context.failed(&err, None, None)),
        };

        let mut store = self.open_store()?;
        store.migrate()?;
        for duplicate in store.duplicate_id_numbers()? {
            warn!(
                id_number = %duplicate.id_number,
                course_ids = ?duplicate.course_ids,
                "id_number shared by several local courses; the lowest id is used"
            );
        }

        let mut source = match ExternalSource::connect(&validated.source) {
            Ok(source) => source,
            Err(err) => return Ok(context.failed(&err, None, None)),
        };
        let records = match read_external_courses(&mut source, &validated) {
            Ok(records) => records,
            Err(err) => {
                release(source);
                return Ok(context.failed(&err, None, None));
            }
        };

        let digest = source_digest(&records);
        let run = run_reconciliation(&mut store, records, policy);
        release(source);

        if let Some(err) = run.halted_by.clone() {
            return Ok(context.failed(&err, Some(run), Some(digest)));
        }

        let status = if run.counts.failed > 0 {
            PassStatus::CompletedWithErrors
        } else {
            PassStatus::Completed
        };
        info!(
            run_id = %context.run_id,
            total = run.counts.total,
            updated = run.counts.updated,
            not_found = run.counts.not_found,
            failed = run.counts.failed,
            "course name synchronisation finished"
        );
        Ok(context.finish(
            status,
            "course name synchronisation finished".to_string(),
            None,
            Some(run),
            Some(digest),
        ))
    }

    /// Read the external rows carrying one identifier, without touching the local store.
    ///
    /// # Errors
    /// Returns the [`SyncError`] of whichever stage failed.
    pub fn show_source(
        &self,
        config: &SyncConfig,
        id_number: &str,
    ) -> Result<Vec<ExternalCourseRecord>, SyncError> {
        let validated = config.validate()?;
        let query = external_course_lookup_query(&validated, id_number)?;
        let mut source = ExternalSource::connect(&validated.source)?;
        let rows = source.fetch_rows(&query);
        release(source);
        records_from_rows(&rows?, &validated)
    }

    /// Validate a configuration and return the resolved view.
    ///
    /// # Errors
    /// Returns the validation error.
    pub fn check_config(config: &SyncConfig) -> Result<ValidatedConfig, SyncError> {
        config.validate()
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_course(&self, course: &NewCourse) -> Result<LocalCourse> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.add_course(course)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_courses(&self) -> Result<Vec<LocalCourse>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_courses()
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}

fn release(source: ExternalSource) {
    if let Err(err) = source.close() {
        warn!(error = %err, "failed to release external course database");
    }
}

fn row_reports(rows: Vec<course_sync_core::RowResult>) -> Vec<RowReport> {
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            let (outcome, error) = match row.outcome {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => (None, Some(err.to_string())),
            };
            RowReport { sequence: index + 1, record: row.record, outcome, error }
        })
        .collect()
}

fn source_digest(records: &[ExternalCourseRecord]) -> String {
    let mut lines = records
        .iter()
        .map(|record| {
            format!("{}\u{1f}{}\u{1f}{}", record.id_number, record.full_name, record.short_name)
        })
        .collect::<Vec<_>>();
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use course_sync_core::OutcomeStatus;
    use rusqlite::{params, Connection};

    use super::*;

    fn unique_temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("course-sync-api-{label}-{}.sqlite3", Ulid::new()))
    }

    fn seed_external(path: &Path, rows: &[(&str, &str, &str)]) -> Result<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch("CREATE TABLE ext_courses (FullName TEXT, ShortName TEXT, IdNumber TEXT);")?;
        for (full_name, short_name, id_number) in rows {
            conn.execute(
                "INSERT INTO ext_courses VALUES (?1, ?2, ?3)",
                params![full_name, short_name, id_number],
            )?;
        }
        Ok(())
    }

    fn config_for(external: &Path) -> Result<SyncConfig> {
        Ok(SyncConfig::from_toml_str(&format!(
            "table = \"ext_courses\"\n\
             [fields]\nfull_name = \"FULLNAME\"\nshort_name = \"SHORTNAME\"\nid_number = \"IDNUMBER\"\n\
             [source]\npath = \"{}\"\n",
            external.display()
        ))?)
    }

    fn new_course(full_name: &str, short_name: &str, id_number: &str) -> NewCourse {
        NewCourse {
            full_name: full_name.to_string(),
            short_name: short_name.to_string(),
            id_number: id_number.to_string(),
        }
    }

    fn cleanup(paths: &[&Path]) {
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }

    #[test]
    fn unconfigured_pass_is_skipped_without_touching_anything() -> Result<()> {
        let db_path = unique_temp_path("skip-db");
        let api = CourseSyncApi::new(db_path.clone());

        let mut config = config_for(Path::new("/nonexistent/ext.sqlite3"))?;
        config.table = String::new();
        let report = api.run_pass(&config, ErrorPolicy::FailFast)?;

        assert_eq!(report.status, PassStatus::Skipped);
        assert_eq!(report.exit_code, 0);
        assert!(report.rows.is_empty());
        assert!(!db_path.exists());
        Ok(())
    }

    #[test]
    fn unreachable_source_fails_with_connection_code() -> Result<()> {
        let db_path = unique_temp_path("conn-db");
        let api = CourseSyncApi::new(db_path.clone());
        let course = api.add_course(&new_course("A", "B", "X"))?;

        let report = api.run_pass(&config_for(&unique_temp_path("absent"))?, ErrorPolicy::FailFast)?;

        assert_eq!(report.status, PassStatus::Failed);
        assert_eq!(report.exit_code, 1);
        assert_eq!(report.error_kind.as_deref(), Some("connection"));
        assert_eq!(api.list_courses()?, vec![course]);
        cleanup(&[&db_path]);
        Ok(())
    }

    #[test]
    fn missing_external_table_fails_with_query_code() -> Result<()> {
        let db_path = unique_temp_path("query-db");
        let external = unique_temp_path("query-ext");
        Connection::open(&external)?.execute_batch("CREATE TABLE other (x TEXT);")?;
        let api = CourseSyncApi::new(db_path.clone());

        let report = api.run_pass(&config_for(&external)?, ErrorPolicy::FailFast)?;

        assert_eq!(report.status, PassStatus::Failed);
        assert_eq!(report.exit_code, 4);
        assert_eq!(report.error_kind.as_deref(), Some("query"));
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    #[test]
    fn pass_updates_drifted_courses_and_second_pass_is_a_no_op() -> Result<()> {
        let db_path = unique_temp_path("pass-db");
        let external = unique_temp_path("pass-ext");
        seed_external(
            &external,
            &[("Algebra II", "ALG2", "M-200"), ("Biology", "BIO", "B-100"), ("Chemistry", "CHEM", "C-300")],
        )?;
        let api = CourseSyncApi::new(db_path.clone());
        let algebra = api.add_course(&new_course("Algebra 2", "ALG2", "M-200"))?;
        let _biology = api.add_course(&new_course("Biology", "BIO", "B-100"))?;
        let config = config_for(&external)?;

        let first = api.run_pass(&config, ErrorPolicy::FailFast)?;
        assert_eq!(first.status, PassStatus::Completed);
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.counts.total, 3);
        assert_eq!(first.counts.updated, 1);
        assert_eq!(first.counts.unchanged, 1);
        assert_eq!(first.counts.not_found, 1);

        let updated_row = first
            .rows
            .iter()
            .find(|row| row.record.id_number == "M-200")
            .and_then(|row| row.outcome.clone());
        match updated_row {
            Some(outcome) => {
                assert_eq!(outcome.status, OutcomeStatus::Updated);
                assert_eq!(outcome.local_course_id, Some(algebra.id));
                assert_eq!(outcome.local_before.map(|names| names.full_name), Some("Algebra 2".to_string()));
            }
            None => panic!("M-200 row missing from report"),
        }

        let second = api.run_pass(&config, ErrorPolicy::FailFast)?;
        assert_eq!(second.counts.updated, 0);
        assert_eq!(second.counts.unchanged, 2);
        assert_eq!(second.source_digest, first.source_digest);
        assert_ne!(second.run_id, first.run_id);

        let courses = api.list_courses()?;
        assert_eq!(courses[0].full_name, "Algebra II");
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    #[test]
    fn blank_external_identifiers_are_reported_not_matched() -> Result<()> {
        let db_path = unique_temp_path("blank-db");
        let external = unique_temp_path("blank-ext");
        seed_external(&external, &[("Orphan", "ORPH", "")])?;
        let api = CourseSyncApi::new(db_path.clone());
        let blank_local = api.add_course(&new_course("Untouched", "UNT", ""))?;

        let report = api.run_pass(&config_for(&external)?, ErrorPolicy::FailFast)?;

        assert_eq!(report.counts.missing_identifier, 1);
        assert_eq!(api.list_courses()?, vec![blank_local]);
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    fn lock_course(db_path: &Path, course_id: i64) -> Result<()> {
        Connection::open(db_path)?.execute_batch(&format!(
            "CREATE TRIGGER lock_course BEFORE UPDATE ON course WHEN OLD.id = {course_id}
             BEGIN SELECT RAISE(ABORT, 'course locked'); END;"
        ))?;
        Ok(())
    }

    #[test]
    fn null_or_blank_external_names_fail_the_row_without_blanking() -> Result<()> {
        let db_path = unique_temp_path("blank-names-db");
        let external = unique_temp_path("blank-names-ext");
        seed_external(&external, &[])?;
        Connection::open(&external)?
            .execute("INSERT INTO ext_courses VALUES (NULL, '   ', 'X1')", [])?;
        let api = CourseSyncApi::new(db_path.clone());
        let course = api.add_course(&new_course("Algebra", "ALG", "X1"))?;

        let report = api.run_pass(&config_for(&external)?, ErrorPolicy::FailFast)?;

        assert_eq!(report.status, PassStatus::Failed);
        assert_eq!(report.exit_code, 5);
        assert_eq!(report.error_kind.as_deref(), Some("update"));
        assert_eq!(report.counts.updated, 0);
        assert!(report.rows[0].error.as_deref().is_some_and(|error| error.contains("full_name")));
        assert_eq!(api.list_courses()?, vec![course]);
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    #[test]
    fn failed_update_halts_a_fail_fast_pass() -> Result<()> {
        let db_path = unique_temp_path("fail-fast-db");
        let external = unique_temp_path("fail-fast-ext");
        seed_external(&external, &[("Algebra II", "ALG2", "M-200"), ("Biology II", "BIO2", "B-100")])?;
        let api = CourseSyncApi::new(db_path.clone());
        api.add_course(&new_course("Algebra 2", "ALG2", "M-200"))?;
        let locked = api.add_course(&new_course("Biology", "BIO", "B-100"))?;
        lock_course(&db_path, locked.id)?;

        let report = api.run_pass(&config_for(&external)?, ErrorPolicy::FailFast)?;

        assert_eq!(report.status, PassStatus::Failed);
        assert_eq!(report.exit_code, 5);
        assert_eq!(report.error_kind.as_deref(), Some("update"));
        assert_eq!(report.counts.failed, 1);
        let failed = report.rows.last().map(|row| (row.record.id_number.clone(), row.error.clone()));
        match failed {
            Some((id_number, Some(error))) => {
                assert_eq!(id_number, "B-100");
                assert!(error.contains("course locked"));
            }
            other => panic!("expected the last row to carry the update error, got {other:?}"),
        }
        assert!(api.list_courses()?.iter().any(|course| course.full_name == "Biology"));
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    #[test]
    fn failed_update_is_recorded_and_continue_pass_finishes() -> Result<()> {
        let db_path = unique_temp_path("continue-db");
        let external = unique_temp_path("continue-ext");
        seed_external(&external, &[("Algebra II", "ALG2", "M-200"), ("Biology II", "BIO2", "B-100")])?;
        let api = CourseSyncApi::new(db_path.clone());
        api.add_course(&new_course("Algebra 2", "ALG2", "M-200"))?;
        let locked = api.add_course(&new_course("Biology", "BIO", "B-100"))?;
        lock_course(&db_path, locked.id)?;

        let report = api.run_pass(&config_for(&external)?, ErrorPolicy::Continue)?;

        assert_eq!(report.status, PassStatus::CompletedWithErrors);
        assert_eq!(report.exit_code, 5);
        assert_eq!(report.error_kind, None);
        assert_eq!(report.error_policy, ErrorPolicy::Continue);
        assert_eq!(report.counts.total, 2);
        assert_eq!(report.counts.updated, 1);
        assert_eq!(report.counts.failed, 1);
        let biology = report.rows.iter().find(|row| row.record.id_number == "B-100");
        assert!(biology.is_some_and(|row| row.outcome.is_none() && row.error.is_some()));

        let names = api.list_courses()?.into_iter().map(|course| course.full_name).collect::<Vec<_>>();
        assert_eq!(names, vec!["Algebra II".to_string(), "Biology".to_string()]);
        cleanup(&[&db_path, &external]);
        Ok(())
    }

    #[test]
    fn show_source_returns_rows_for_one_identifier() -> Result<()> {
        let external = unique_temp_path("show-ext");
        seed_external(&external, &[("Biology", "BIO", "B-100"), ("Chemistry", "CHEM", "C-300")])?;
        let api = CourseSyncApi::new(unique_temp_path("show-db"));

        let records = api.show_source(&config_for(&external)?, "C-300")?;
        assert_eq!(
            records,
            vec![ExternalCourseRecord {
                full_name: "Chemistry".to_string(),
                short_name: "CHEM".to_string(),
                id_number: "C-300".to_string(),
            }]
        );
        cleanup(&[&external]);
        Ok(())
    }

    #[test]
    fn unreadable_config_is_rejected_with_invalid_config_code() {
        let err = SyncError::InvalidConfig("expected `=`".to_string());
        let report = PassReport::rejected(&err, ErrorPolicy::Continue);
        assert_eq!(report.status, PassStatus::Failed);
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.error_policy, ErrorPolicy::Continue);
        assert_eq!(report.source_digest, None);
    }

    #[test]
    fn source_digest_ignores_row_order() {
        let a = ExternalCourseRecord {
            full_name: "A".to_string(),
            short_name: "A".to_string(),
            id_number: "1".to_string(),
        };
        let b = ExternalCourseRecord { id_number: "2".to_string(), ..a.clone() };
        assert_eq!(source_digest(&[a.clone(), b.clone()]), source_digest(&[b, a]));
    }
}
