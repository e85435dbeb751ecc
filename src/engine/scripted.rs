//! In-memory engine with scriptable failures.
//!
//! Every knob is a countdown ("fail the next N opens") so a test can describe
//! an outage precisely, then read back what the lifecycle code did with it.

use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use super::{Connection, Connector, PROBE_STATEMENT, Pool, PoolOptions, QueryOutput, VERIFY_STATEMENT};
use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const DEFAULT_VERSION: &str = "PostgreSQL 16.4 (scripted)";

// -----------------------------------------------------------------------------
// ----- ScriptedConnector -----------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

#[derive(Debug, Default)]
struct Script {
    version: Mutex<Option<String>>,
    open_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    failing_statements: Mutex<Vec<String>>,

    open_failures: AtomicU32,
    verify_failures: AtomicU32,
    probe_steps: AtomicU32,
    probes_until_break: AtomicU32,
    rollback_failures: AtomicU32,
    close_failures: AtomicU32,

    open_attempts: AtomicU32,
    opens: AtomicU32,
    disposes: AtomicU32,
    live_pools: AtomicU32,
    max_live_pools: AtomicU32,
    connections_opened: AtomicU32,
    connections_closed: AtomicU32,

    pools: Mutex<Vec<Arc<PoolState>>>,
    statements: Mutex<Vec<String>>,
}

// -----------------------------------------------------------------------------
// ----- ScriptedConnector: Static ---------------------------------------------

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: impl Into<String>) -> Self {
        let connector = Self::default();
        *connector.script.version.lock() = Some(version.into());
        connector
    }
}

// -----------------------------------------------------------------------------
// ----- ScriptedConnector: Failure injection ----------------------------------

impl ScriptedConnector {
    pub fn fail_next_opens(&self, n: u32) {
        self.script.open_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_verifications(&self, n: u32) {
        self.script.verify_failures.store(n, Ordering::SeqCst);
    }

    /// Fail `n` probes, letting one through before each failure. Every
    /// acquisition attempt probes twice (manager first, then session), so
    /// on a warm engine this fails the session probe of `n` attempts.
    pub fn fail_every_other_probe(&self, n: u32) {
        self.script.probe_steps.store(n.saturating_mul(2), Ordering::SeqCst);
    }

    /// Break every live pool right after the `n`-th successful probe from
    /// now: the engine passes validation and dies before it is used.
    pub fn break_engine_after_probes(&self, n: u32) {
        self.script.probes_until_break.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_rollbacks(&self, n: u32) {
        self.script.rollback_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.script.close_failures.store(n, Ordering::SeqCst);
    }

    /// Every execution of exactly `statement` fails with a server error.
    pub fn fail_statement(&self, statement: impl Into<String>) {
        self.script.failing_statements.lock().push(statement.into());
    }

    /// Widen the window in which concurrent callers could race an open.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.script.open_delay.lock() = delay;
    }

    /// Make every connection close take `delay`, so a caller can be
    /// cancelled while its session is being released.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.script.close_delay.lock() = delay;
    }

    /// Simulate the server going away: every live pool starts refusing work.
    pub fn break_engine(&self) {
        self.script.break_live_pools();
    }
}

// -----------------------------------------------------------------------------
// ----- ScriptedConnector: Observation ----------------------------------------

impl ScriptedConnector {
    pub fn open_attempts(&self) -> u32 {
        self.script.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.script.opens.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> u32 {
        self.script.disposes.load(Ordering::SeqCst)
    }

    pub fn live_pools(&self) -> u32 {
        self.script.live_pools.load(Ordering::SeqCst)
    }

    pub fn max_live_pools(&self) -> u32 {
        self.script.max_live_pools.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u32 {
        self.script.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u32 {
        self.script.connections_closed.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.script.statements.lock().clone()
    }

    pub fn count_statement(&self, statement: &str) -> usize {
        self.script
            .statements
            .lock()
            .iter()
            .filter(|s| s.as_str() == statement)
            .count()
    }
}

// -----------------------------------------------------------------------------
// ----- ScriptedConnector: Connector ------------------------------------------

impl Connector for ScriptedConnector {
    type Pool = ScriptedPool;

    async fn open(&self, _options: &PoolOptions) -> Result<ScriptedPool, BackendError> {
        let script = &self.script;
        script.open_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *script.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if take(&script.open_failures) {
            return Err(BackendError::rejected("connection refused (scripted)"));
        }

        let id = script.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let live = script.live_pools.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_live_pools.fetch_max(live, Ordering::SeqCst);

        let state = Arc::new(PoolState {
            id,
            broken: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        script.pools.lock().push(state.clone());

        Ok(ScriptedPool {
            state,
            script: script.clone(),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- ScriptedPool ----------------------------------------------------------

#[derive(Debug)]
pub struct ScriptedPool {
    state: Arc<PoolState>,
    script: Arc<Script>,
}

#[derive(Debug)]
struct PoolState {
    id: u32,
    broken: AtomicBool,
    disposed: AtomicBool,
}

impl ScriptedPool {
    /// One-based open order, so tests can tell engines apart.
    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

impl Pool for ScriptedPool {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, BackendError> {
        if self.state.disposed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed("pool disposed"));
        }
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(BackendError::rejected(
                "server closed the connection unexpectedly (scripted)",
            ));
        }

        self.script.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            pool: self.state.clone(),
            script: self.script.clone(),
        })
    }

    async fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.script.disposes.fetch_add(1, Ordering::SeqCst);
        self.script.live_pools.fetch_sub(1, Ordering::SeqCst);
        self.script
            .pools
            .lock()
            .retain(|p| !Arc::ptr_eq(p, &self.state));
    }
}

// -----------------------------------------------------------------------------
// ----- ScriptedConnection ----------------------------------------------------

#[derive(Debug)]
pub struct ScriptedConnection {
    pool: Arc<PoolState>,
    script: Arc<Script>,
}

impl Connection for ScriptedConnection {
    async fn execute(&mut self, statement: &str) -> Result<QueryOutput, BackendError> {
        let script = &self.script;
        script.statements.lock().push(statement.to_string());

        if self.pool.broken.load(Ordering::SeqCst) {
            return Err(BackendError::rejected("connection reset by peer (scripted)"));
        }

        match statement {
            PROBE_STATEMENT if script.probe_fails() => {
                Err(BackendError::rejected("probe failed (scripted)"))
            }
            PROBE_STATEMENT => {
                let remaining = script.probes_until_break.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |n| n.checked_sub(1),
                );
                if remaining == Ok(1) {
                    script.break_live_pools();
                }
                Ok(QueryOutput::scalar("1"))
            }
            VERIFY_STATEMENT if take(&script.verify_failures) => {
                Err(BackendError::rejected("verification failed (scripted)"))
            }
            VERIFY_STATEMENT => {
                let version = script.version.lock().clone();
                Ok(QueryOutput::scalar(
                    version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
                ))
            }
            "ROLLBACK" if take(&script.rollback_failures) => {
                Err(BackendError::rejected("rollback failed (scripted)"))
            }
            other if script.failing_statements.lock().iter().any(|s| s == other) => {
                Err(BackendError::Server {
                    severity: "ERROR".to_string(),
                    code: "XX000".to_string(),
                    message: format!("scripted failure for {other:?}"),
                })
            }
            other => {
                let tag = other
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                Ok(QueryOutput::command(tag))
            }
        }
    }

    async fn close(self) -> Result<(), BackendError> {
        let delay = *self.script.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.script.connections_closed.fetch_add(1, Ordering::SeqCst);
        if take(&self.script.close_failures) {
            return Err(BackendError::rejected("close failed (scripted)"));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

impl Script {
    /// Steps count down from `2n`; the odd ones fail.
    fn probe_fails(&self) -> bool {
        self.probe_steps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|step| step % 2 == 1)
    }

    fn break_live_pools(&self) {
        for pool in self.pools.lock().iter() {
            pool.broken.store(true, Ordering::SeqCst);
        }
    }
}

/// Decrement a countdown; true when it was still positive.
fn take(countdown: &AtomicU32) -> bool {
    countdown
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn options() -> PoolOptions {
        DatabaseConfig::default().pool_options()
    }

    #[tokio::test]
    async fn countdowns_run_out() {
        let connector = ScriptedConnector::new();
        connector.fail_next_opens(2);

        assert!(connector.open(&options()).await.is_err());
        assert!(connector.open(&options()).await.is_err());
        let pool = connector.open(&options()).await.unwrap();

        assert_eq!(pool.id(), 1);
        assert_eq!(connector.open_attempts(), 3);
        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.live_pools(), 1);
    }

    #[tokio::test]
    async fn broken_pools_refuse_connections_until_disposed() {
        let connector = ScriptedConnector::new();
        let pool = connector.open(&options()).await.unwrap();
        let mut conn = pool.connect().await.unwrap();

        connector.break_engine();

        assert!(conn.execute(PROBE_STATEMENT).await.is_err());
        assert!(pool.connect().await.is_err());

        pool.dispose().await;
        pool.dispose().await;
        assert!(pool.is_disposed());
        assert_eq!(connector.disposes(), 1);
        assert_eq!(connector.live_pools(), 0);
        assert!(matches!(pool.connect().await, Err(BackendError::Closed(_))));
    }

    #[tokio::test]
    async fn probe_knobs_alternate_and_break() {
        let connector = ScriptedConnector::new();
        let pool = connector.open(&options()).await.unwrap();
        let mut conn = pool.connect().await.unwrap();

        connector.fail_every_other_probe(2);
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(conn.execute(PROBE_STATEMENT).await.is_ok());
        }
        assert_eq!(outcomes, [true, false, true, false, true]);

        connector.break_engine_after_probes(2);
        conn.execute(PROBE_STATEMENT).await.unwrap();
        assert!(pool.connect().await.is_ok());
        conn.execute(PROBE_STATEMENT).await.unwrap();
        assert!(pool.connect().await.is_err());
    }

    #[tokio::test]
    async fn reports_configured_version_and_logs_statements() {
        let connector = ScriptedConnector::with_version("PostgreSQL 15.2");
        connector.fail_statement("DELETE FROM pages");
        let pool = connector.open(&options()).await.unwrap();
        let mut conn = pool.connect().await.unwrap();

        let version = conn.execute(VERIFY_STATEMENT).await.unwrap();
        assert_eq!(version.first_value(), Some("PostgreSQL 15.2"));

        let out = conn.execute("insert into pages values (1)").await.unwrap();
        assert_eq!(out.command_tag.as_deref(), Some("INSERT"));

        let err = conn.execute("DELETE FROM pages").await.unwrap_err();
        assert!(matches!(err, BackendError::Server { .. }));

        conn.close().await.unwrap();
        assert_eq!(connector.count_statement("DELETE FROM pages"), 1);
        assert_eq!(connector.connections_opened(), connector.connections_closed());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
