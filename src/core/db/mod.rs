/// Database Module
///
/// The data-access layer, organized into focused submodules.
///
/// ## Architecture
///
/// - **Query Builder** (`builder.rs`): select AST, conditions, and the
///   INSERT/UPDATE/DELETE statement builders. Everything serializes to a
///   `Statement`, a template plus bound values.
/// - **Driver** (`driver.rs`): the seam between the engine and a physical
///   connection. SQLite through rusqlite is the shipped implementation.
/// - **Connection Management** (`connection.rs`): the single session, its
///   state machine, and reconnect backoff.
/// - **Query Execution** (`query.rs`): the `Database` service that
///   serializes every operation through one connection lock.
/// - **Procedures** (`procedures.rs`): named procedures with IN/OUT
///   parameters and their typed wrappers.
/// - **Schema** (`schema.rs`): the bot tables the layer reads and writes.
///
/// ## Error Handling
///
/// Soft-fail operations log and return empty values; `try_*` variants and
/// procedure calls return `DalError`.
pub mod builder;
pub mod connection;
pub mod driver;
pub mod procedures;
pub mod query;
pub mod schema;

pub use builder::*;
pub use connection::*;
pub use driver::*;
pub use procedures::*;
pub use query::*;
pub use schema::*;

pub use rusqlite::types::Value;
