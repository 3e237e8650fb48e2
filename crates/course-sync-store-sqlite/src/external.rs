use course_sync_core::{CourseSource, RawRow, SelectQuery, SourceConfig, SyncError};
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info};

/// Read-only connection to the external course database.
///
/// Acquired once per pass. Dropping it releases the connection; `close`
/// does the same and reports failures.
pub struct ExternalSource {
    conn: Connection,
    debug: bool,
}

impl ExternalSource {
    /// Open the external database read-only and run the optional setup statement.
    ///
    /// # Errors
    /// Returns [`SyncError::Connection`] when the database cannot be opened,
    /// is not a database, or rejects the setup statement.
    pub fn connect(config: &SourceConfig) -> Result<Self, SyncError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.path, flags)
            .map_err(|err| SyncError::Connection(format!("{}: {err}", config.path)))?;

        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|err| SyncError::Connection(format!("{}: {err}", config.path)))?;

        if let Some(setup_sql) = config.setup_sql.as_deref() {
            if config.debug {
                info!(sql = %setup_sql, "external source setup statement");
            }
            conn.execute_batch(setup_sql)
                .map_err(|err| SyncError::Connection(format!("setup statement failed: {err}")))?;
        }

        debug!(path = %config.path, "connected to external course database");
        Ok(Self { conn, debug: config.debug })
    }

    /// Release the connection.
    ///
    /// # Errors
    /// Returns [`SyncError::Connection`] when `SQLite` refuses to close.
    pub fn close(self) -> Result<(), SyncError> {
        self.conn
            .close()
            .map_err(|(_, err)| SyncError::Connection(format!("failed to close: {err}")))?;
        debug!("closed external course database");
        Ok(())
    }
}

impl CourseSource for ExternalSource {
    fn fetch_rows(&mut self, query: &SelectQuery) -> Result<Vec<RawRow>, SyncError> {
        if self.debug {
            info!(sql = %query.sql, params = query.params.len(), "external source query");
        } else {
            debug!(sql = %query.sql, "external source query");
        }

        let mut stmt = self.conn.prepare(&query.sql).map_err(query_error)?;
        let columns = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();
        let mut rows = stmt.query(params_from_iter(query.params.iter())).map_err(query_error)?;

        let mut fetched = Vec::new();
        while let Some(row) = rows.next().map_err(query_error)? {
            let mut raw = RawRow::new();
            for (index, column) in columns.iter().enumerate() {
                let value = match row.get_ref(index).map_err(query_error)? {
                    ValueRef::Null => Vec::new(),
                    ValueRef::Integer(value) => value.to_string().into_bytes(),
                    ValueRef::Real(value) => value.to_string().into_bytes(),
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes.to_vec(),
                };
                raw.insert(column.clone(), value);
            }
            fetched.push(raw);
        }
        Ok(fetched)
    }
}

fn query_error(err: rusqlite::Error) -> SyncError {
    SyncError::Query(err.to_string())
}
