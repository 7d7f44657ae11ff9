/// Data-access Error Module
///
/// This module defines the error type shared by the query builder, the
/// connection manager, the execution engine and the option store.
use rusqlite::ErrorCode;
use thiserror::Error;

/// Error type for the data-access layer.
///
/// Most public operations soft-fail (they log and return an empty value);
/// this type is what the `try_*` variants and the procedure wrappers return.
#[derive(Error, Debug)]
pub enum DalError {
    /// Errors reported by SQLite
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The physical connection could not be opened or was lost
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The reconnect budget ran out without a healthy connection
    #[error("Connectivity lost: gave up after {attempts} reconnect attempts ({waited_ms} ms)")]
    ConnectivityExhausted { attempts: u32, waited_ms: u64 },

    /// Statement construction or execution errors
    #[error("Query error: {0}")]
    Query(String),

    /// Procedure parameter binding and format errors
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// Bootstrap and settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A poisoned connection or cache lock
    #[error("Lock error: {0}")]
    Lock(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file parse errors
    #[error("Settings error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DalError {
    /// Whether the error means the connection itself is unusable.
    pub fn is_connectivity(&self) -> bool {
        match self {
            DalError::Connectivity(_) | DalError::ConnectivityExhausted { .. } => true,
            DalError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

/// Type alias for Result to use DalError as the error type.
pub type Result<T> = std::result::Result<T, DalError>;
