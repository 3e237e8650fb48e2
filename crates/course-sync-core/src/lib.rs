use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod codec;
pub mod config;
pub mod query;

pub use codec::TextCodec;
pub use config::{FieldMapping, FieldName, ResolvedFields, SourceConfig, SyncConfig, ValidatedConfig};
pub use query::{quote_identifier, SelectBuilder, SelectQuery};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("course name sync not configured: {0} is empty")]
    NotConfigured(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("error while communicating with external course database: {0}")]
    Connection(String),
    #[error("error reading data from the external course table: {0}")]
    Query(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("local course store error: {0}")]
    Store(String),
    #[error("failed to update course {course_id}: {message}")]
    Update { course_id: i64, message: String },
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Encoding(_) => "encoding",
            Self::Store(_) => "store",
            Self::Update { .. } => "update",
        }
    }

    /// Process exit code reported to the scheduler for this failure.
    ///
    /// `NotConfigured` is a skip, not a failure, and maps to `0`.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotConfigured(_) => 0,
            Self::Connection(_) => 1,
            Self::InvalidConfig(_) => 2,
            Self::Query(_) | Self::Encoding(_) => 4,
            Self::Store(_) | Self::Update { .. } => 5,
        }
    }
}

/// One course row as published by the external system of record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ExternalCourseRecord {
    pub full_name: String,
    pub short_name: String,
    /// Empty when no identifier column is configured or the row has none.
    pub id_number: String,
}

impl ExternalCourseRecord {
    #[must_use]
    pub fn has_identifier(&self) -> bool {
        !self.id_number.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LocalCourse {
    pub id: i64,
    pub full_name: String,
    pub short_name: String,
    pub id_number: String,
}

impl LocalCourse {
    #[must_use]
    pub fn names(&self) -> CourseNames {
        CourseNames { full_name: self.full_name.clone(), short_name: self.short_name.clone() }
    }

    #[must_use]
    pub fn names_match(&self, record: &ExternalCourseRecord) -> bool {
        self.full_name == record.full_name && self.short_name == record.short_name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CourseNames {
    pub full_name: String,
    pub short_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Unchanged,
    Updated,
    NotFound,
    MissingIdentifier,
}

impl OutcomeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::NotFound => "not_found",
            Self::MissingIdentifier => "missing_identifier",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconciliationOutcome {
    pub status: OutcomeStatus,
    pub matched: bool,
    pub updated: bool,
    pub local_course_id: Option<i64>,
    /// Local names as found before any update was applied.
    pub local_before: Option<CourseNames>,
}

impl ReconciliationOutcome {
    fn unmatched(status: OutcomeStatus) -> Self {
        Self { status, matched: false, updated: false, local_course_id: None, local_before: None }
    }

    fn matched(course: &LocalCourse, updated: bool) -> Self {
        Self {
            status: if updated { OutcomeStatus::Updated } else { OutcomeStatus::Unchanged },
            matched: true,
            updated,
            local_course_id: Some(course.id),
            local_before: Some(course.names()),
        }
    }
}

/// A raw external row: column name to undecoded value bytes. NULL arrives empty.
pub type RawRow = BTreeMap<String, Vec<u8>>;

/// Read side of the external system of record.
pub trait CourseSource {
    /// Execute a read statement and return every row.
    ///
    /// # Errors
    /// Returns [`SyncError::Query`] when the statement fails.
    fn fetch_rows(&mut self, query: &SelectQuery) -> Result<Vec<RawRow>, SyncError>;
}

/// The local course catalog being kept in sync.
pub trait CourseStore {
    /// Find the course carrying `id_number`; ties resolve to the lowest id.
    ///
    /// # Errors
    /// Returns [`SyncError::Store`] when the lookup fails.
    fn find_by_id_number(&self, id_number: &str) -> Result<Option<LocalCourse>, SyncError>;

    /// Persist `full_name` and `short_name` of `course` by primary key.
    ///
    /// # Errors
    /// Returns [`SyncError::Update`] when the write fails or no row changed.
    fn update_names(&mut self, course: &LocalCourse) -> Result<(), SyncError>;
}

/// Lower-case column keys, decode values, and trim surrounding whitespace.
///
/// # Errors
/// Returns [`SyncError::Encoding`] when a value cannot be decoded.
pub fn normalize_row(raw: &RawRow, codec: &TextCodec) -> Result<BTreeMap<String, String>, SyncError> {
    let lowered = raw
        .iter()
        .map(|(key, value)| (key.to_lowercase(), value.clone()))
        .collect::<RawRow>();
    let decoded = codec.decode_row(&lowered)?;
    Ok(decoded.into_iter().map(|(key, value)| (key, value.trim().to_string())).collect())
}

/// Map a normalized row onto the configured fields.
///
/// # Errors
/// Returns [`SyncError::Query`] when a configured column is absent from the row.
pub fn record_from_row(
    row: &BTreeMap<String, String>,
    fields: &ResolvedFields,
) -> Result<ExternalCourseRecord, SyncError> {
    let column = |field: &FieldName| {
        row.get(&field.key).cloned().ok_or_else(|| {
            SyncError::Query(format!("column {} missing from external result", field.name))
        })
    };

    Ok(ExternalCourseRecord {
        full_name: column(&fields.full_name)?,
        short_name: column(&fields.short_name)?,
        id_number: match &fields.id_number {
            Some(field) => column(field)?,
            None => String::new(),
        },
    })
}

/// The distinct, unfiltered, unsorted read of the configured table.
///
/// # Errors
/// Does not fail for a validated config; only filter values are encoded and
/// this query has none.
pub fn external_courses_query(config: &ValidatedConfig) -> Result<SelectQuery, SyncError> {
    SelectBuilder::new(&config.table)
        .fields(&config.fields.select_list())
        .distinct()
        .build(&config.codec)
}

/// Rows of the configured table carrying one identifier, sorted by full name.
///
/// # Errors
/// Returns [`SyncError::InvalidConfig`] when no identifier column is configured
/// and [`SyncError::Encoding`] when `id_number` cannot be encoded.
pub fn external_course_lookup_query(
    config: &ValidatedConfig,
    id_number: &str,
) -> Result<SelectQuery, SyncError> {
    let id_field = config.fields.id_number.as_ref().ok_or_else(|| {
        SyncError::InvalidConfig("fields.id_number is required to look up one course".to_string())
    })?;
    SelectBuilder::new(&config.table)
        .fields(&config.fields.select_list())
        .filter_eq(&id_field.name, id_number)
        .order_by(&config.fields.full_name.name)
        .build(&config.codec)
}

/// Normalize raw rows into records.
///
/// # Errors
/// Fails on the first undecodable or incomplete row.
pub fn records_from_rows(
    rows: &[RawRow],
    config: &ValidatedConfig,
) -> Result<Vec<ExternalCourseRecord>, SyncError> {
    rows.iter()
        .map(|raw| record_from_row(&normalize_row(raw, &config.codec)?, &config.fields))
        .collect()
}

/// Fetch and normalize every external course record, in source order.
///
/// # Errors
/// Propagates source failures and fails on undecodable or incomplete rows.
pub fn read_external_courses<S: CourseSource + ?Sized>(
    source: &mut S,
    config: &ValidatedConfig,
) -> Result<Vec<ExternalCourseRecord>, SyncError> {
    let query = external_courses_query(config)?;
    let rows = source.fetch_rows(&query)?;
    debug!(rows = rows.len(), table = %config.table, "fetched external course rows");
    records_from_rows(&rows, config)
}

/// Reconcile a single external record against the store.
///
/// # Errors
/// Propagates lookup and update failures from the store. A drifted record
/// with a blank full or short name is an [`SyncError::Update`] and is never
/// written.
pub fn reconcile_one<S: CourseStore + ?Sized>(
    store: &mut S,
    record: &ExternalCourseRecord,
) -> Result<ReconciliationOutcome, SyncError> {
    if !record.has_identifier() {
        warn!(
            full_name = %record.full_name,
            short_name = %record.short_name,
            "skipping external course without identifier"
        );
        return Ok(ReconciliationOutcome::unmatched(OutcomeStatus::MissingIdentifier));
    }

    let Some(local) = store.find_by_id_number(&record.id_number)? else {
        debug!(id_number = %record.id_number, "no local course for identifier");
        return Ok(ReconciliationOutcome::unmatched(OutcomeStatus::NotFound));
    };

    if local.names_match(record) {
        return Ok(ReconciliationOutcome::matched(&local, false));
    }

    if let Some(column) = blank_name_column(record) {
        return Err(SyncError::Update {
            course_id: local.id,
            message: format!("external {column} is blank for id_number {}", record.id_number),
        });
    }

    let renamed = LocalCourse {
        full_name: record.full_name.clone(),
        short_name: record.short_name.clone(),
        ..local.clone()
    };
    store.update_names(&renamed)?;
    debug!(
        course_id = local.id,
        id_number = %record.id_number,
        from = %local.full_name,
        to = %record.full_name,
        "updated local course names"
    );
    Ok(ReconciliationOutcome::matched(&local, true))
}

fn blank_name_column(record: &ExternalCourseRecord) -> Option<&'static str> {
    if record.full_name.trim().is_empty() {
        Some("full_name")
    } else if record.short_name.trim().is_empty() {
        Some("short_name")
    } else {
        None
    }
}

/// One reconciled row: the record and its independent result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    pub record: ExternalCourseRecord,
    pub outcome: Result<ReconciliationOutcome, SyncError>,
}

/// Lazily reconciles records one by one; the caller decides whether to stop
/// on a failed row.
pub struct Reconciler<'a, S: ?Sized, I> {
    store: &'a mut S,
    records: I,
}

impl<S, I> Iterator for Reconciler<'_, S, I>
where
    S: CourseStore + ?Sized,
    I: Iterator<Item = ExternalCourseRecord>,
{
    type Item = RowResult;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let outcome = reconcile_one(self.store, &record);
        Some(RowResult { record, outcome })
    }
}

pub fn reconcile<S, I>(store: &mut S, records: I) -> Reconciler<'_, S, I::IntoIter>
where
    S: CourseStore + ?Sized,
    I: IntoIterator<Item = ExternalCourseRecord>,
{
    Reconciler { store, records: records.into_iter() }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop at the first row whose reconciliation fails.
    #[default]
    FailFast,
    /// Record the failure against the row and keep going.
    Continue,
}

impl ErrorPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct OutcomeCounts {
    pub total: usize,
    pub matched: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub not_found: usize,
    pub missing_identifier: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &Result<ReconciliationOutcome, SyncError>) {
        self.total += 1;
        match outcome {
            Ok(outcome) => {
                if outcome.matched {
                    self.matched += 1;
                }
                match outcome.status {
                    OutcomeStatus::Updated => self.updated += 1,
                    OutcomeStatus::Unchanged => self.unchanged += 1,
                    OutcomeStatus::NotFound => self.not_found += 1,
                    OutcomeStatus::MissingIdentifier => self.missing_identifier += 1,
                }
            }
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRun {
    pub rows: Vec<RowResult>,
    pub counts: OutcomeCounts,
    /// Set when a fail-fast run stopped early; holds the row's error.
    pub halted_by: Option<SyncError>,
}

/// Drive a full reconciliation under `policy`.
pub fn run_reconciliation<S, I>(store: &mut S, records: I, policy: ErrorPolicy) -> ReconciliationRun
where
    S: CourseStore + ?Sized,
    I: IntoIterator<Item = ExternalCourseRecord>,
{
    let mut rows = Vec::new();
    let mut counts = OutcomeCounts::default();
    let mut halted_by = None;

    for row in reconcile(store, records) {
        counts.record(&row.outcome);
        let failure = row.outcome.as_ref().err().cloned();
        rows.push(row);

        if let Some(err) = failure {
            warn!(error = %err, policy = policy.as_str(), "course reconciliation failed");
            if policy == ErrorPolicy::FailFast {
                halted_by = Some(err);
                break;
            }
        }
    }

    ReconciliationRun { rows, counts, halted_by }
}

/// Identifiers shared by more than one local course.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateIdNumber {
    pub id_number: String,
    pub course_ids: Vec<i64>,
}
