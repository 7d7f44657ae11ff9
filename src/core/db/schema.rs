/// Bot Schema Module
///
/// Tables the data-access layer reads and writes. Installation is
/// idempotent.

use crate::core::db::query::Database;
use crate::core::Result;
use tracing::info;

/// DDL for the bot tables.
///
/// `channelconfig` rows are per-channel overrides of `configuration` rows.
/// Inserts into `channelconfig` and `message` are positional, so column
/// order here is part of the contract.
pub const BOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS configuration (
    configuration_id INTEGER PRIMARY KEY AUTOINCREMENT,
    configuration_name TEXT NOT NULL UNIQUE,
    configuration_value TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS channel (
    channel_id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_name TEXT NOT NULL UNIQUE,
    channel_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS channelconfig (
    cc_channel INTEGER NOT NULL REFERENCES channel (channel_id) ON DELETE CASCADE,
    cc_config INTEGER NOT NULL REFERENCES configuration (configuration_id) ON DELETE CASCADE,
    cc_value TEXT NOT NULL,
    PRIMARY KEY (cc_channel, cc_config)
);

CREATE TABLE IF NOT EXISTS message (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_name TEXT NOT NULL,
    message_description TEXT NOT NULL DEFAULT '',
    message_text TEXT NOT NULL,
    message_updateonchange INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_message_name ON message (message_name);

CREATE TABLE IF NOT EXISTS interwikis (
    iw_id INTEGER PRIMARY KEY AUTOINCREMENT,
    iw_prefix TEXT NOT NULL UNIQUE,
    iw_url TEXT NOT NULL
);
"#;

impl Database {
    /// Creates any missing bot tables
    pub fn install_schema(&self) -> Result<()> {
        info!("Installing bot schema");
        self.with_connection(|conn| conn.execute_batch(BOT_SCHEMA))
    }
}
