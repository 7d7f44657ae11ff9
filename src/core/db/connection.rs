/// Connection Management Module
///
/// Owns the single physical connection, its state machine, and the
/// reconnect backoff that runs before every operation.

use crate::config::BootstrapConfig;
use crate::core::db::builder::Statement;
use crate::core::db::driver::{Driver, RowSet, Session};
use crate::core::{DalError, Result};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle of the physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never opened, or closed on request
    #[default]
    Disconnected,
    /// Open requested, handshake not finished
    Connecting,
    /// Idle and usable
    Open,
    /// Reading a result set
    Fetching,
    /// Running a statement
    Executing,
    /// Open failed or the connection was lost
    Failed,
}

impl ConnectionState {
    /// States in which the connection is considered usable
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Open | ConnectionState::Fetching | ConnectionState::Executing
        )
    }
}

/// Reconnect timing.
///
/// Pauses start at `initial_delay` and grow by `growth_factor` after each
/// attempt. Once the cumulative wait reaches `budget` the manager gives up
/// with [`DalError::ConnectivityExhausted`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub growth_factor: f64,
    pub budget: Duration,
    /// Poll interval while a session finishes its handshake
    pub poll_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1000),
            growth_factor: 1.5,
            budget: Duration::from_secs(180),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ReconnectPolicy {
    /// A fresh pause schedule for one reconnect sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            delay_ms: (self.initial_delay.as_millis() as u64).max(1),
            growth_factor: self.growth_factor.max(1.0),
            budget_ms: self.budget.as_millis() as u64,
            waited_ms: 0,
        }
    }
}

/// Pause schedule of one reconnect sequence.
///
/// Yields growing pauses in whole milliseconds. The last pause is clamped
/// so the total never exceeds the budget, after which the iterator ends.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay_ms: u64,
    growth_factor: f64,
    budget_ms: u64,
    waited_ms: u64,
}

impl Backoff {
    /// Total wait charged against the budget so far
    pub fn waited(&self) -> Duration {
        Duration::from_millis(self.waited_ms)
    }

    pub fn is_exhausted(&self) -> bool {
        self.waited_ms >= self.budget_ms
    }

    /// Budget not yet spent
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.budget_ms.saturating_sub(self.waited_ms))
    }

    /// Charges a wait spent outside the pause schedule
    pub fn charge(&mut self, wait: Duration) {
        self.waited_ms = self.waited_ms.saturating_add(wait.as_millis() as u64);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let pause = self.delay_ms.min(self.budget_ms - self.waited_ms);
        self.waited_ms += pause;
        // short delays must still grow by at least 1 ms
        let grown = ((self.delay_ms as f64) * self.growth_factor) as u64;
        self.delay_ms = if self.growth_factor > 1.0 {
            grown.max(self.delay_ms + 1)
        } else {
            grown
        };
        Some(Duration::from_millis(pause))
    }
}

/// Owner of the single session.
///
/// Not synchronized on its own; [`crate::core::db::Database`] keeps it
/// behind the connection-wide lock.
pub struct ConnectionManager {
    driver: Box<dyn Driver>,
    bootstrap: BootstrapConfig,
    policy: ReconnectPolicy,
    session: Option<Box<dyn Session>>,
    state: ConnectionState,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.bootstrap.hostname)
            .field("schema", &self.bootstrap.schema)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a disconnected manager
    pub fn new(driver: Box<dyn Driver>, bootstrap: BootstrapConfig, policy: ReconnectPolicy) -> Self {
        ConnectionManager {
            driver,
            bootstrap,
            policy,
            session: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Opens the physical connection, replacing any previous one.
    ///
    /// Failures are logged and reported as `false`; this never returns an
    /// error for ordinary connectivity problems.
    pub fn connect(&mut self) -> bool {
        info!(
            host = %self.bootstrap.hostname,
            port = self.bootstrap.port,
            user = %self.bootstrap.username,
            schema = %self.bootstrap.schema,
            "Opening database connection..."
        );
        self.session = None;
        self.state = ConnectionState::Connecting;

        match self.driver.open(&self.bootstrap) {
            Ok(session) => {
                self.state = if session.is_connecting() {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Open
                };
                self.session = Some(session);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to open database connection");
                self.state = ConnectionState::Failed;
                false
            }
        }
    }

    /// Closes the connection
    pub fn disconnect(&mut self) {
        self.session = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Makes sure a healthy connection exists, reconnecting with backoff.
    ///
    /// Retries until the connection is healthy or the cumulative wait
    /// reaches the policy budget; then fails exactly once with
    /// [`DalError::ConnectivityExhausted`] and leaves the state `Failed`.
    pub fn ensure_live(&mut self) -> Result<()> {
        let mut backoff = self.policy.backoff();
        self.await_handshake(&mut backoff);
        if self.is_healthy() {
            return Ok(());
        }
        if self.state.is_live() {
            warn!("Database connection stopped answering");
            self.state = ConnectionState::Failed;
        }

        let mut attempts: u32 = 0;
        while let Some(pause) = backoff.next() {
            attempts += 1;
            warn!(
                attempt = attempts,
                delay_ms = pause.as_millis() as u64,
                "Reconnecting to database..."
            );
            thread::sleep(pause);

            if self.connect() {
                self.await_handshake(&mut backoff);
                if self.is_healthy() {
                    info!(attempts, "Database connection re-established");
                    return Ok(());
                }
            }
        }

        self.state = ConnectionState::Failed;
        let waited_ms = backoff.waited().as_millis() as u64;
        error!(attempts, waited_ms, "Giving up on database connection");
        Err(DalError::ConnectivityExhausted {
            attempts,
            waited_ms,
        })
    }

    /// Runs a statement that produces no rows
    pub fn execute(&mut self, stmt: &Statement) -> Result<usize> {
        self.run(ConnectionState::Executing, |session| session.execute(stmt))
    }

    /// Runs a statement and collects its rows
    pub fn query(&mut self, stmt: &Statement) -> Result<RowSet> {
        self.run(ConnectionState::Fetching, |session| session.query(stmt))
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.run(ConnectionState::Executing, |session| session.execute_batch(sql))
    }

    /// Row id of the last insert, or -1 without a session
    pub fn last_insert_id(&self) -> i64 {
        self.session.as_ref().map_or(-1, |session| session.last_insert_id())
    }

    fn is_healthy(&mut self) -> bool {
        if !self.state.is_live() {
            return false;
        }
        self.session.as_mut().map_or(false, |session| session.is_alive())
    }

    /// Polls while the session is still connecting. The wait counts
    /// against the reconnect budget.
    fn await_handshake(&mut self, backoff: &mut Backoff) {
        while self.session.as_ref().map_or(false, |s| s.is_connecting()) {
            if backoff.is_exhausted() {
                return;
            }
            self.state = ConnectionState::Connecting;
            let wait = self.policy.poll_interval.min(backoff.remaining());
            thread::sleep(wait);
            backoff.charge(wait);
        }
        if self.state == ConnectionState::Connecting && self.session.is_some() {
            self.state = ConnectionState::Open;
        }
    }

    fn run<T>(
        &mut self,
        busy: ConnectionState,
        op: impl FnOnce(&mut dyn Session) -> Result<T>,
    ) -> Result<T> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DalError::Connectivity("no open connection".to_string()))?;
        self.state = busy;

        let result = op(session.as_mut());
        self.state = match &result {
            Err(e) if e.is_connectivity() => {
                warn!(error = %e, "Connection lost during statement");
                ConnectionState::Failed
            }
            _ => ConnectionState::Open,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_policy, FlakyDriver};

    fn manager(driver: FlakyDriver) -> ConnectionManager {
        ConnectionManager::new(Box::new(driver), FlakyDriver::bootstrap(), fast_policy())
    }

    #[test]
    fn test_default_backoff_sequence() {
        let delays: Vec<u64> = ReconnectPolicy::default()
            .backoff()
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(&delays[..4], &[1000, 1500, 2250, 3375]);
        assert_eq!(delays.len(), 12);
        assert_eq!(*delays.last().unwrap(), 9034);
        assert_eq!(delays.iter().sum::<u64>(), 180_000);
    }

    #[test]
    fn test_backoff_charges_external_waits() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            growth_factor: 2.0,
            budget: Duration::from_millis(25),
            poll_interval: Duration::from_millis(1),
        };
        let mut backoff = policy.backoff();
        backoff.charge(Duration::from_millis(20));
        assert_eq!(backoff.next(), Some(Duration::from_millis(5)));
        assert_eq!(backoff.next(), None);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn test_short_delays_still_grow() {
        let delays: Vec<u64> = fast_policy()
            .backoff()
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1, 2, 3, 4, 6, 4]);
        for pair in delays[..delays.len() - 1].windows(2) {
            assert!(pair[1] > pair[0], "delay did not grow: {:?}", delays);
        }
    }

    #[test]
    fn test_unit_growth_keeps_delay_constant() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            growth_factor: 1.0,
            budget: Duration::from_millis(12),
            poll_interval: Duration::from_millis(1),
        };
        let delays: Vec<u64> = policy.backoff().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![5, 5, 2]);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (driver, _handle) = FlakyDriver::new();
        let mut conn = manager(driver);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert!(conn.connect());
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.ensure_live().is_ok());

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.last_insert_id(), -1);
    }

    #[test]
    fn test_connect_failure_returns_false() {
        let (driver, handle) = FlakyDriver::new();
        handle.refuse_connections(true);
        let mut conn = manager(driver);

        assert!(!conn.connect());
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_ensure_live_reconnects_dropped_session() {
        let (driver, handle) = FlakyDriver::new();
        let mut conn = manager(driver);
        assert!(conn.connect());

        handle.drop_connections();
        conn.ensure_live().unwrap();

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(handle.opens(), 2);
    }

    #[test]
    fn test_ensure_live_gives_up_after_budget() {
        let (driver, handle) = FlakyDriver::new();
        handle.refuse_connections(true);
        let mut conn = manager(driver);

        match conn.ensure_live() {
            Err(DalError::ConnectivityExhausted { attempts, waited_ms }) => {
                assert!(attempts >= 1);
                assert_eq!(waited_ms, fast_policy().budget.as_millis() as u64);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(handle.opens(), 0);
    }

    #[test]
    fn test_ensure_live_waits_for_handshake() {
        let (driver, handle) = FlakyDriver::new();
        handle.handshake_polls(3);
        let mut conn = manager(driver);

        assert!(conn.connect());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.ensure_live().unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(handle.opens(), 1);
    }

    #[test]
    fn test_endless_handshake_stops_at_budget() {
        let (driver, handle) = FlakyDriver::new();
        handle.handshake_polls(u32::MAX);
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            growth_factor: 1.5,
            budget: Duration::from_millis(25),
            poll_interval: Duration::from_millis(7),
        };
        let mut conn = ConnectionManager::new(Box::new(driver), FlakyDriver::bootstrap(), policy);

        match conn.ensure_live() {
            Err(DalError::ConnectivityExhausted { attempts, waited_ms }) => {
                assert_eq!(attempts, 1);
                assert_eq!(waited_ms, 25);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(handle.opens(), 1);
    }

    #[test]
    fn test_connectivity_error_during_statement_marks_failed() {
        let (driver, handle) = FlakyDriver::new();
        let mut conn = manager(driver);
        assert!(conn.connect());

        handle.drop_connections();
        let err = conn.query(&Statement::new("SELECT 1")).unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_statement_error_keeps_connection_open() {
        let (driver, _handle) = FlakyDriver::new();
        let mut conn = manager(driver);
        assert!(conn.connect());

        assert!(conn.query(&Statement::new("SELECT * FROM nowhere")).is_err());
        assert_eq!(conn.state(), ConnectionState::Open);
    }
}
