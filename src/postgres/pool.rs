use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{debug, warn};

use super::connection::{PgConnection, with_timeout};
use crate::engine::{Connection, PROBE_STATEMENT, Pool, PoolOptions, QueryOutput};
use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- PgPool ----------------------------------------------------------------

/// Lazily filled connection pool.
///
/// At most `pool_size + max_overflow` connections exist at once (one
/// semaphore permit each, held by idle and checked-out connections alike);
/// at most `pool_size` of them are kept idle.
#[derive(Debug)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    options: PoolOptions,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

#[derive(Debug)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub available: usize,
    pub max: u32,
}

impl PgPool {
    pub fn new(options: PoolOptions) -> Self {
        let max = options.max_connections();
        Self {
            inner: Arc::new(PoolInner {
                options,
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(max as usize)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().await.len();
        let available = self.inner.permits.available_permits();
        let max = self.inner.options.max_connections();
        let in_use = (max as usize).saturating_sub(available).saturating_sub(idle);

        PoolStats {
            idle,
            in_use,
            available,
            max,
        }
    }
}

impl Pool for PgPool {
    type Connection = PooledConnection;

    async fn connect(&self) -> Result<PooledConnection, BackendError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed("pool disposed"));
        }

        while let Some(idle) = inner.pop_idle().await {
            if let Some(conn) = inner.revalidate(idle.conn).await {
                inner.trace("checkout (reused)");
                return Ok(PooledConnection::new(inner.clone(), conn, idle.permit));
            }
        }

        let acquire_timeout = inner.options.acquire_timeout;
        let permit = timeout(acquire_timeout, inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| BackendError::Timeout(acquire_timeout))?
            .map_err(|_| BackendError::Closed("pool disposed"))?;

        let conn = PgConnection::connect(&inner.options.target, inner.options.connect_timeout).await?;
        inner.trace("checkout (new connection)");

        Ok(PooledConnection::new(inner.clone(), conn, permit))
    }

    async fn dispose(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();

        let drained: Vec<_> = inner.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.conn.terminate().await {
                debug!("terminate during dispose failed: {e}");
            }
        }

        debug!(idle_closed = count, "pool disposed");
    }
}

// -----------------------------------------------------------------------------
// ----- PoolInner -------------------------------------------------------------

impl PoolInner {
    async fn pop_idle(&self) -> Option<IdleConnection> {
        self.idle.lock().await.pop_front()
    }

    /// Discard idle connections past `recycle`; ping the rest when
    /// `pre_ping` is on. Returns the connection only if it is still usable.
    async fn revalidate(&self, mut conn: PgConnection) -> Option<PgConnection> {
        if conn.age() >= self.options.recycle {
            self.trace("recycling connection past its lifetime");
            if let Err(e) = conn.terminate().await {
                debug!("terminate during recycle failed: {e}");
            }
            return None;
        }

        if !self.options.pre_ping {
            return Some(conn);
        }

        let limit = self.options.connect_timeout;
        match with_timeout(limit, conn.simple_query(PROBE_STATEMENT)).await {
            Ok(_) => Some(conn),
            Err(e) => {
                warn!("discarding idle connection that failed pre-ping: {e}");
                None
            }
        }
    }

    async fn check_in(&self, conn: PgConnection, permit: OwnedSemaphorePermit) -> Result<(), BackendError> {
        if conn.is_broken() || self.closed.load(Ordering::Acquire) {
            self.trace("checkin (discarded)");
            return conn.terminate().await;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.options.pool_size as usize {
            drop(idle);
            self.trace("checkin (overflow closed)");
            return conn.terminate().await;
        }

        idle.push_back(IdleConnection { conn, permit });
        self.trace("checkin");
        Ok(())
    }

    fn trace(&self, event: &str) {
        if self.options.echo_pool {
            debug!(
                available = self.permits.available_permits(),
                "pool {event}"
            );
        }
    }
}

#[derive(Debug)]
struct IdleConnection {
    conn: PgConnection,
    permit: OwnedSemaphorePermit,
}

// -----------------------------------------------------------------------------
// ----- PooledConnection ------------------------------------------------------

#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<PgConnection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: PgConnection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit: Some(permit),
        }
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        self.conn
            .as_mut()
            .expect("pooled connection missing backend connection")
    }
}

impl Connection for PooledConnection {
    async fn execute(&mut self, statement: &str) -> Result<QueryOutput, BackendError> {
        self.connection().simple_query(statement).await
    }

    async fn close(mut self) -> Result<(), BackendError> {
        let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) else {
            return Ok(());
        };
        self.pool.check_in(conn, permit).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Reached without `close` only when the holder was cancelled mid-use;
        // the server state is unknown, so the socket is dropped, not reused.
        if self.conn.take().is_some() {
            debug!("pooled connection dropped without close; discarding");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
