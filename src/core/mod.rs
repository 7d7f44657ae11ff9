/// Core Module
///
/// This module contains the data-access infrastructure the rest of the bot
/// builds on: the query builder, the connection manager, the execution
/// engine, and the shared error type.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{DalError, Result};
