/// Query Execution Module
///
/// The [`Database`] service: every read, write and procedure call goes
/// through one connection-wide lock, so at most one statement is in flight
/// in the whole process.
///
/// Most operations soft-fail: errors are logged and the caller sees an
/// empty value, `-1` or `false`. The `try_*` variants return the error
/// instead, for callers that must tell "no data" apart from "store failed".

use crate::config::BootstrapConfig;
use crate::core::db::builder::{
    delete_statement, insert_statement, update_statement, Condition, SelectQuery, Statement,
};
use crate::core::db::connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
use crate::core::db::driver::{Driver, Row, RowSet, SqliteDriver};
use crate::core::db::procedures::ProcedureCatalog;
use crate::core::{DalError, Result};
use rusqlite::types::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Renders a value the way callers expect scalar text: NULL is empty.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// The execution engine.
///
/// Owns the connection manager behind a mutex that is held for the whole
/// of every operation, reconnect retries included.
#[derive(Debug)]
pub struct Database {
    connection: Mutex<ConnectionManager>,
    procedures: ProcedureCatalog,
}

impl Database {
    /// Wraps an existing connection manager
    pub fn new(manager: ConnectionManager, procedures: ProcedureCatalog) -> Self {
        Database {
            connection: Mutex::new(manager),
            procedures,
        }
    }

    /// Creates the service and makes the first connection attempt.
    ///
    /// A failed first attempt is only logged; the next operation retries
    /// with backoff.
    pub fn connect(
        driver: Box<dyn Driver>,
        bootstrap: BootstrapConfig,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let mut manager = ConnectionManager::new(driver, bootstrap, policy);
        if !manager.connect() {
            warn!("Initial database connection failed; retrying on first use");
        }
        Ok(Database::new(manager, ProcedureCatalog::with_defaults()?))
    }

    /// Connects through the SQLite driver rooted at `data_dir`
    pub fn open_sqlite(
        data_dir: impl Into<PathBuf>,
        bootstrap: BootstrapConfig,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        Database::connect(Box::new(SqliteDriver::new(data_dir)), bootstrap, policy)
    }

    pub fn procedures(&self) -> &ProcedureCatalog {
        &self.procedures
    }

    pub fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.lock()?.state())
    }

    /// Drops the physical connection; the next operation reconnects.
    pub fn disconnect(&self) -> Result<()> {
        self.lock()?.disconnect();
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ConnectionManager>> {
        self.connection
            .lock()
            .map_err(|_| DalError::Lock("Failed to acquire database lock".to_string()))
    }

    /// Runs `op` on a live connection while holding the connection lock.
    pub(crate) fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut ConnectionManager) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        conn.ensure_live()?;
        op(&mut conn)
    }

    /// Runs a statement expected to produce no rows
    pub fn try_execute_non_query(&self, stmt: &Statement) -> Result<usize> {
        debug!(sql = %stmt.render(), "Executing non-query");
        self.with_connection(|conn| conn.execute(stmt))
    }

    /// Soft-fail variant of [`Database::try_execute_non_query`]
    pub fn execute_non_query(&self, stmt: &Statement) {
        if let Err(e) = self.try_execute_non_query(stmt) {
            error!(error = %e, sql = %stmt.text, "Non-query failed");
        }
    }

    /// Runs a statement and collects its rows and column names
    pub fn try_execute_reader_query(&self, stmt: &Statement) -> Result<RowSet> {
        debug!(sql = %stmt.render(), "Executing reader query");
        self.with_connection(|conn| conn.query(stmt))
    }

    /// Soft-fail variant of [`Database::try_execute_reader_query`]
    pub fn execute_reader_query(&self, stmt: &Statement) -> Option<RowSet> {
        match self.try_execute_reader_query(stmt) {
            Ok(rows) => Some(rows),
            Err(e) => {
                error!(error = %e, sql = %stmt.text, "Reader query failed");
                None
            }
        }
    }

    pub fn try_execute_select(&self, query: &SelectQuery) -> Result<RowSet> {
        self.try_execute_reader_query(&query.serialize())
    }

    /// Runs a select and returns every row, or nothing on failure
    pub fn execute_select(&self, query: &SelectQuery) -> Vec<Row> {
        self.execute_select_with_columns(query).1
    }

    /// Like [`Database::execute_select`], also returning the column names
    pub fn execute_select_with_columns(&self, query: &SelectQuery) -> (Vec<String>, Vec<Row>) {
        match self.execute_reader_query(&query.serialize()) {
            Some(rows) => (rows.columns, rows.rows),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn try_execute_scalar_select(&self, query: &SelectQuery) -> Result<String> {
        let rows = self.try_execute_select(query)?;
        Ok(rows
            .rows
            .first()
            .and_then(|row| row.first())
            .map(value_to_text)
            .unwrap_or_default())
    }

    /// First column of the first row as text; empty when there are no rows
    /// or the query failed.
    pub fn execute_scalar_select(&self, query: &SelectQuery) -> String {
        self.try_execute_scalar_select(query).unwrap_or_else(|e| {
            error!(error = %e, sql = %query, "Scalar select failed");
            String::new()
        })
    }

    /// Inserts one row positionally and returns its generated id
    pub fn try_insert(&self, table: &str, values: &[Value]) -> Result<i64> {
        let stmt = insert_statement(table, values);
        debug!(sql = %stmt.render(), "Executing insert");
        self.with_connection(|conn| {
            conn.execute(&stmt)?;
            Ok(conn.last_insert_id())
        })
    }

    /// Soft-fail insert; -1 on failure
    pub fn insert(&self, table: &str, values: &[Value]) -> i64 {
        self.try_insert(table, values).unwrap_or_else(|e| {
            error!(error = %e, table, "Insert failed");
            -1
        })
    }

    /// Updates at most `limit` matching rows (0 = all); returns the count.
    pub fn try_update(
        &self,
        table: &str,
        items: &[(&str, Value)],
        limit: usize,
        conditions: &[Condition],
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        self.try_execute_non_query(&update_statement(table, items, limit, conditions))
    }

    /// Soft-fail update. An empty `items` list succeeds without a round trip.
    pub fn update(
        &self,
        table: &str,
        items: &[(&str, Value)],
        limit: usize,
        conditions: &[Condition],
    ) -> bool {
        match self.try_update(table, items, limit, conditions) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, table, "Update failed");
                false
            }
        }
    }

    /// Deletes at most `limit` matching rows (0 = all); returns the count.
    pub fn try_delete(&self, table: &str, limit: usize, conditions: &[Condition]) -> Result<usize> {
        self.try_execute_non_query(&delete_statement(table, limit, conditions))
    }

    /// Soft-fail delete
    pub fn delete(&self, table: &str, limit: usize, conditions: &[Condition]) -> bool {
        match self.try_delete(table, limit, conditions) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, table, "Delete failed");
                false
            }
        }
    }
}
