/// # Test Utilities Module
///
/// Fixtures shared by the unit tests:
/// - [`FlakyDriver`], a file-backed SQLite driver whose connections can be
///   refused, dropped or held in a slow handshake from the test
/// - [`TestDatabase`], a [`Database`] over that driver, optionally seeded
///   with the bot schema and sample rows

use crate::config::BootstrapConfig;
use crate::core::db::{
    Database, Driver, ReconnectPolicy, RowSet, Session, SqliteDriver, Statement,
};
use crate::core::{DalError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Sample rows used by most tests
pub const SEED_DATA: &str = r#"
INSERT INTO configuration (configuration_id, configuration_name, configuration_value) VALUES
    (1, 'silence', 'false'),
    (2, 'baseWiki', 'enwiki'),
    (3, 'emptyOption', '');

INSERT INTO channel (channel_id, channel_name, channel_enabled) VALUES
    (1, '##helpmebot', 1),
    (2, '#wikipedia-en-help', 1);

INSERT INTO channelconfig (cc_channel, cc_config, cc_value) VALUES
    (1, 1, 'true');

INSERT INTO message (message_name, message_description, message_text, message_updateonchange) VALUES
    ('cmdPat', 'Pat a user', 'pats {0}', 1),
    ('done', 'Acknowledgement', 'Done.', 1),
    ('done', 'Acknowledgement', 'Finished.', 1),
    ('no-change', 'Nothing to do', 'No change.', 0),
    ('greeting', 'Join greeting', 'Hello {0}, welcome to {1}!', 1);

INSERT INTO interwikis (iw_prefix, iw_url) VALUES
    ('w', 'https://en.wikipedia.org/wiki/$1');
"#;

/// Reconnect policy with a 20 ms budget so exhaustion tests finish quickly
pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(1),
        growth_factor: 1.5,
        budget: Duration::from_millis(20),
        poll_interval: Duration::from_millis(1),
    }
}

#[derive(Default)]
struct FlakyState {
    refuse: AtomicBool,
    opens: AtomicU32,
    attempts: AtomicU32,
    handshake_polls: AtomicU32,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
}

/// SQLite driver over a private temp directory with injectable failures
pub struct FlakyDriver {
    inner: SqliteDriver,
    state: Arc<FlakyState>,
    dir: Arc<TempDir>,
}

/// Test-side controls for a [`FlakyDriver`]
#[derive(Clone)]
pub struct FlakyHandle {
    state: Arc<FlakyState>,
}

impl FlakyDriver {
    pub fn new() -> (FlakyDriver, FlakyHandle) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let state = Arc::new(FlakyState::default());
        let driver = FlakyDriver {
            inner: SqliteDriver::new(dir.path()),
            state: state.clone(),
            dir: Arc::new(dir),
        };
        (driver, FlakyHandle { state })
    }

    pub fn bootstrap() -> BootstrapConfig {
        BootstrapConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "helpmebot".to_string(),
            password: "secret".to_string(),
            schema: "helpmebot".to_string(),
        }
    }
}

impl Driver for FlakyDriver {
    fn open(&self, config: &BootstrapConfig) -> Result<Box<dyn Session>> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(DalError::Connectivity("connection refused".to_string()));
        }

        let inner = self.inner.open(config)?;
        let dropped = Arc::new(AtomicBool::new(false));
        if let Ok(mut sessions) = self.state.sessions.lock() {
            sessions.push(dropped.clone());
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FlakySession {
            inner,
            dropped,
            handshake: AtomicU32::new(self.state.handshake_polls.load(Ordering::SeqCst)),
        }))
    }
}

impl FlakyHandle {
    /// Makes every following open fail with a connectivity error
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Kills every session opened so far
    pub fn drop_connections(&self) {
        if let Ok(sessions) = self.state.sessions.lock() {
            for dropped in sessions.iter() {
                dropped.store(true, Ordering::SeqCst);
            }
        }
    }

    /// New sessions report a pending handshake for this many checks
    pub fn handshake_polls(&self, polls: u32) {
        self.state.handshake_polls.store(polls, Ordering::SeqCst);
    }

    /// Successful opens
    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Opens tried, successful or not
    pub fn open_attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

struct FlakySession {
    inner: Box<dyn Session>,
    dropped: Arc<AtomicBool>,
    handshake: AtomicU32,
}

impl FlakySession {
    fn check(&self) -> Result<()> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(DalError::Connectivity("server has gone away".to_string()));
        }
        Ok(())
    }
}

impl Session for FlakySession {
    fn execute(&mut self, stmt: &Statement) -> Result<usize> {
        self.check()?;
        self.inner.execute(stmt)
    }

    fn query(&mut self, stmt: &Statement) -> Result<RowSet> {
        self.check()?;
        self.inner.query(stmt)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.check()?;
        self.inner.execute_batch(sql)
    }

    fn last_insert_id(&self) -> i64 {
        self.inner.last_insert_id()
    }

    fn is_alive(&mut self) -> bool {
        self.check().is_ok() && self.inner.is_alive()
    }

    fn is_connecting(&self) -> bool {
        self.handshake
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A database service over a private temp directory
pub struct TestDatabase {
    pub db: Arc<Database>,
    _dir: Arc<TempDir>,
}

impl TestDatabase {
    fn connect(driver: FlakyDriver) -> Self {
        let dir = driver.dir.clone();
        let db = Database::connect(Box::new(driver), FlakyDriver::bootstrap(), fast_policy())
            .expect("Failed to create test database");
        TestDatabase {
            db: Arc::new(db),
            _dir: dir,
        }
    }

    /// Connected, no tables
    pub fn empty() -> Self {
        let (driver, _handle) = FlakyDriver::new();
        TestDatabase::connect(driver)
    }

    /// Bot schema installed and [`SEED_DATA`] loaded
    pub fn seeded() -> Self {
        let (driver, _handle) = FlakyDriver::new();
        TestDatabase::with_driver(driver)
    }

    /// Seeded database over a driver the test keeps a handle to
    pub fn with_driver(driver: FlakyDriver) -> Self {
        let fixture = TestDatabase::connect(driver);
        fixture.db.install_schema().expect("Failed to install schema");
        fixture
            .db
            .with_connection(|conn| conn.execute_batch(SEED_DATA))
            .expect("Failed to seed test database");
        fixture
    }
}
