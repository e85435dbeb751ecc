//! The seam between the lifecycle logic and a concrete database client.
//!
//! A [`Connector`] opens a [`Pool`]; a pool hands out [`Connection`]s. The
//! connection manager and the session layer only ever talk to these traits.

pub mod scripted;

use secrecy::{ExposeSecret, SecretString};
use smallvec::SmallVec;
use std::{fmt, future::Future, time::Duration};

use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Cheapest possible round trip, used to validate liveness.
pub const PROBE_STATEMENT: &str = "SELECT 1";

/// Run once against a freshly opened engine; the scalar is the server identity.
pub const VERIFY_STATEMENT: &str = "SELECT version()";

// -----------------------------------------------------------------------------
// ----- Traits ----------------------------------------------------------------

pub trait Connector: Send + Sync + 'static {
    type Pool: Pool;

    fn open(
        &self,
        options: &PoolOptions,
    ) -> impl Future<Output = Result<Self::Pool, BackendError>> + Send;
}

pub trait Pool: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, BackendError>> + Send;

    /// Release every pooled resource. Must be safe to call more than once.
    fn dispose(&self) -> impl Future<Output = ()> + Send;
}

pub trait Connection: Send + 'static {
    fn execute(
        &mut self,
        statement: &str,
    ) -> impl Future<Output = Result<QueryOutput, BackendError>> + Send;

    /// Hand the connection back. Consumes it, so it can only happen once.
    fn close(self) -> impl Future<Output = Result<(), BackendError>> + Send;
}

pub type ConnectionOf<C> = <<C as Connector>::Pool as Pool>::Connection;

// -----------------------------------------------------------------------------
// ----- Probe -----------------------------------------------------------------

/// Borrow one connection, run the probe, hand it back.
pub async fn probe<P: Pool>(pool: &P) -> Result<(), BackendError> {
    let mut conn = pool.connect().await?;
    let outcome = conn.execute(PROBE_STATEMENT).await;
    let closed = conn.close().await;
    outcome?;
    closed
}

// -----------------------------------------------------------------------------
// ----- QueryOutput -----------------------------------------------------------

pub type Row = SmallVec<[Option<String>; 4]>;

/// Text-format result of one statement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub command_tag: Option<String>,
}

impl QueryOutput {
    pub fn scalar(value: impl Into<String>) -> Self {
        let mut row = Row::new();
        row.push(Some(value.into()));
        Self {
            columns: vec!["?column?".to_string()],
            rows: vec![row],
            command_tag: Some("SELECT 1".to_string()),
        }
    }

    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            command_tag: Some(tag.into()),
            ..Default::default()
        }
    }

    /// First column of the first row, when present and not NULL.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

// -----------------------------------------------------------------------------
// ----- PoolOptions -----------------------------------------------------------

/// Everything a connector needs to open a pool.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub target: ConnectTarget,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub recycle: Duration,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub pre_ping: bool,
    pub echo_pool: bool,
}

impl PoolOptions {
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow).max(1)
    }
}

#[derive(Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: SecretString,
}

impl ConnectTarget {
    pub fn password_exposed(&self) -> &str {
        self.password.expose_secret()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
