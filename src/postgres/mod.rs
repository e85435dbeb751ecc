//! PostgreSQL implementation of the engine seam, speaking the v3 wire
//! protocol directly over tokio sockets.

mod connection;
mod pool;
mod scram;
pub mod wire;

pub use connection::PgConnection;
pub use pool::{PgPool, PoolStats, PooledConnection};

use tracing::debug;

use crate::engine::{Connector, PoolOptions};
use crate::errors::BackendError;

/// Opens [`PgPool`]s. Opening does no I/O; the first connection is made on
/// the first `connect`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for PgConnector {
    type Pool = PgPool;

    async fn open(&self, options: &PoolOptions) -> Result<PgPool, BackendError> {
        debug!(
            server = %options.target,
            max_connections = options.max_connections(),
            "opening postgres pool"
        );
        Ok(PgPool::new(options.clone()))
    }
}
