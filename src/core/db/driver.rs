/// Driver Module
///
/// The seam between the connection manager and a physical connection. A
/// [`Driver`] opens a [`Session`] from the bootstrap credentials; the
/// connection manager owns at most one session at a time.

use crate::config::BootstrapConfig;
use crate::core::db::builder::Statement;
use crate::core::{DalError, Result};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// A materialized result row
pub type Row = Vec<Value>;

/// Column names and eagerly collected rows of a reader query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Index of a column, compared case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// One open physical connection.
pub trait Session: Send {
    /// Runs a statement that produces no rows, returning the affected count
    fn execute(&mut self, stmt: &Statement) -> Result<usize>;

    /// Runs a statement and collects every row
    fn query(&mut self, stmt: &Statement) -> Result<RowSet>;

    /// Runs several `;`-separated statements without parameters
    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    /// Row id generated by the most recent successful insert
    fn last_insert_id(&self) -> i64;

    /// Liveness probe
    fn is_alive(&mut self) -> bool;

    /// Whether the session is still completing its handshake
    fn is_connecting(&self) -> bool {
        false
    }
}

/// Opens sessions from bootstrap credentials.
pub trait Driver: Send + Sync {
    fn open(&self, config: &BootstrapConfig) -> Result<Box<dyn Session>>;
}

/// SQLite driver. The bootstrap schema names a database file inside
/// `data_dir`; the schema `:memory:` opens a private in-memory database.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    data_dir: PathBuf,
}

impl SqliteDriver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        SqliteDriver {
            data_dir: data_dir.into(),
        }
    }

    /// Resolves the database file for a schema name.
    ///
    /// Returns `Ok(None)` for `:memory:`.
    pub fn database_path(&self, schema: &str) -> Result<Option<PathBuf>> {
        let schema = schema.trim();
        if schema == ":memory:" {
            return Ok(None);
        }
        if schema.is_empty()
            || schema.contains('/')
            || schema.contains('\\')
            || schema.contains("..")
        {
            return Err(DalError::Connectivity(format!(
                "invalid schema name '{}'",
                schema
            )));
        }
        Ok(Some(self.data_dir.join(format!("{}.db", schema))))
    }
}

impl Driver for SqliteDriver {
    fn open(&self, config: &BootstrapConfig) -> Result<Box<dyn Session>> {
        let conn = match self.database_path(&config.schema)? {
            Some(path) => {
                debug!(path = %path.display(), "Opening SQLite database");
                Connection::open(&path)
            }
            None => Connection::open_in_memory(),
        }
        .map_err(|e| DalError::Connectivity(format!("cannot open '{}': {}", config.schema, e)))?;

        conn.busy_timeout(Duration::from_secs(5))
            .and_then(|_| conn.execute_batch("PRAGMA foreign_keys = ON;"))
            .map_err(|e| DalError::Connectivity(format!("cannot initialize connection: {}", e)))?;

        Ok(Box::new(SqliteSession { conn }))
    }
}

/// A session over one rusqlite connection
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    pub fn new(conn: Connection) -> Self {
        SqliteSession { conn }
    }
}

impl Session for SqliteSession {
    fn execute(&mut self, stmt: &Statement) -> Result<usize> {
        let mut prepared = self.conn.prepare_cached(&stmt.text)?;
        Ok(prepared.execute(params_from_iter(stmt.params.iter()))?)
    }

    fn query(&mut self, stmt: &Statement) -> Result<RowSet> {
        let mut prepared = self.conn.prepare_cached(&stmt.text)?;
        let columns: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let column_count = prepared.column_count();

        let rows = prepared
            .query_map(params_from_iter(stmt.params.iter()), |row| {
                (0..column_count)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Row>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RowSet { columns, rows })
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn is_alive(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}
