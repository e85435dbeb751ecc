//! Owner of the one live pooled engine.
//!
//! # State machine
//! ```text
//! NoEngine ──(rebuild ok)────────► Healthy
//! Healthy  ──(probe ok)──────────► Healthy
//! Healthy  ──(probe fails)───────► NoEngine ──► rebuild
//! NoEngine ──(retries exhausted)─► NoEngine   (next call starts over)
//! ```
//!
//! Every transition happens under one async mutex, so concurrent callers
//! queue behind a rebuild and then share its result instead of racing to
//! open engines of their own.

mod cell;

pub use cell::ManagerCell;

use parking_lot::RwLock;
use std::{ops::Deref, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::config::DatabaseConfig;
use crate::engine::{self, Connection, Connector, Pool, VERIFY_STATEMENT};
use crate::errors::{BackendError, DbError};
use crate::metrics::{Counter, Metrics};

// -----------------------------------------------------------------------------
// ----- EngineHandle ----------------------------------------------------------

/// Shared reference to the live pool, tagged with the rebuild that made it.
#[derive(Debug)]
pub struct EngineHandle<P> {
    pool: Arc<P>,
    generation: u64,
}

impl<P> EngineHandle<P> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }
}

impl<P> Clone for EngineHandle<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            generation: self.generation,
        }
    }
}

impl<P> Deref for EngineHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.pool
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionManager -----------------------------------------------------

pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: DatabaseConfig,
    backoff: Backoff,
    metrics: Arc<Metrics>,

    /// Authoritative slot. Only ever written while this lock is held.
    slot: Mutex<EngineSlot<C::Pool>>,

    /// Copy of the slot's handle for readers that must not queue behind a
    /// rebuild (health checks).
    published: RwLock<Option<EngineHandle<C::Pool>>>,
    server_version: RwLock<Option<String>>,
}

struct EngineSlot<P> {
    handle: Option<EngineHandle<P>>,
    generation: u64,
}

// -----------------------------------------------------------------------------
// ----- ConnectionManager: Static ---------------------------------------------

impl<C: Connector> ConnectionManager<C> {
    pub fn new(config: DatabaseConfig, connector: C) -> Self {
        Self::with_metrics(config, connector, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: DatabaseConfig, connector: C, metrics: Arc<Metrics>) -> Self {
        info!(
            url = %config.url_redacted(),
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            max_retries = config.max_retries,
            "connection manager initialized"
        );

        Self {
            backoff: config.engine_backoff(),
            connector,
            config,
            metrics,
            slot: Mutex::new(EngineSlot {
                handle: None,
                generation: 0,
            }),
            published: RwLock::new(None),
            server_version: RwLock::new(None),
        }
    }

    /// Replace the engine retry policy (the default comes from the config).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionManager: Public ---------------------------------------------

impl<C: Connector> ConnectionManager<C> {
    /// Validated engine handle, building or repairing the engine first if needed.
    pub async fn get_engine(&self) -> Result<EngineHandle<C::Pool>, DbError> {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = slot.handle.clone() {
            match engine::probe(handle.pool()).await {
                Ok(()) => return Ok(handle),
                Err(e) => {
                    warn!(
                        generation = handle.generation(),
                        "existing database engine is broken: {e}"
                    );
                    self.teardown(&mut slot).await;
                }
            }
        }

        self.rebuild(&mut slot).await
    }

    /// Probe the current engine without creating or replacing anything.
    pub async fn health_check(&self) -> bool {
        let Some(handle) = self.published.read().clone() else {
            return false;
        };
        engine::probe(handle.pool()).await.is_ok()
    }

    /// Release the engine and every pooled connection. Safe to repeat.
    pub async fn dispose(&self) {
        let mut slot = self.slot.lock().await;
        if slot.handle.is_some() {
            self.teardown(&mut slot).await;
            info!("database engine disposed");
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Server identity reported by the last successful rebuild.
    pub fn server_version(&self) -> Option<String> {
        self.server_version.read().clone()
    }

    /// Generation of the live engine; `None` while absent.
    pub fn generation(&self) -> Option<u64> {
        self.published.read().as_ref().map(EngineHandle::generation)
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionManager: Private --------------------------------------------

impl<C: Connector> ConnectionManager<C> {
    async fn rebuild(
        &self,
        slot: &mut EngineSlot<C::Pool>,
    ) -> Result<EngineHandle<C::Pool>, DbError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            info!(
                "creating database engine (attempt {}/{max_attempts})",
                attempt + 1
            );

            match self.open_verified().await {
                Ok((pool, version)) => {
                    slot.generation += 1;
                    let handle = EngineHandle {
                        pool: Arc::new(pool),
                        generation: slot.generation,
                    };

                    match &version {
                        Some(v) => info!(generation = slot.generation, "database connection successful: {v}"),
                        None => info!(generation = slot.generation, "database connection successful"),
                    }

                    self.metrics.add(Counter::ReconnectAttempts, u64::from(attempt));
                    *self.server_version.write() = version;
                    *self.published.write() = Some(handle.clone());
                    slot.handle = Some(handle.clone());

                    return Ok(handle);
                }
                Err(e) => {
                    error!(
                        "error creating database engine (attempt {}/{max_attempts}): {e}",
                        attempt + 1
                    );

                    if attempt + 1 < max_attempts {
                        let wait = self.backoff.delay(attempt);
                        info!("waiting {} before retry", humantime::format_duration(wait));
                        tokio::time::sleep(wait).await;
                    }

                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());

        error!("failed to connect to database after {max_attempts} attempts");
        self.metrics.record_failure(last_error.clone());

        Err(DbError::ConnectionUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Open a pool and run the verification query on it. On any failure the
    /// partially built pool is disposed before returning.
    async fn open_verified(&self) -> Result<(C::Pool, Option<String>), BackendError> {
        let pool = self.connector.open(&self.config.pool_options()).await?;

        match verify(&pool).await {
            Ok(version) => Ok((pool, version)),
            Err(e) => {
                pool.dispose().await;
                Err(e)
            }
        }
    }

    async fn teardown(&self, slot: &mut EngineSlot<C::Pool>) {
        *self.published.write() = None;
        if let Some(handle) = slot.handle.take() {
            handle.pool().dispose().await;
        }
    }
}

async fn verify<P: Pool>(pool: &P) -> Result<Option<String>, BackendError> {
    let mut conn = pool.connect().await?;
    let outcome = conn.execute(VERIFY_STATEMENT).await;
    let closed = conn.close().await;
    let output = outcome?;
    closed?;
    Ok(output.first_value().map(str::to_string))
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
