//! Short-lived sessions over the managed engine.
//!
//! Acquisition retries on its own (linear backoff), independent of the
//! engine rebuild loop in the manager. Every leased session is released
//! exactly once, on a spawned task: awaited by `complete`/`fail`, detached
//! when the guard is dropped.

mod guard;
mod lease;

pub use guard::SessionGuard;
pub use lease::Session;

use std::{
    any::Any,
    fmt,
    future::{Future, poll_fn},
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::Poll,
};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backoff::Backoff;
use crate::engine::{Connection, ConnectionOf, Connector, PROBE_STATEMENT, Pool};
use crate::errors::{BackendError, DbError};
use crate::manager::ConnectionManager;
use crate::metrics::Counter;

/// Future returned by the callback given to [`SessionFactory::scope`].
pub type ScopeFuture<'s, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 's>>;

// -----------------------------------------------------------------------------
// ----- SessionExit -----------------------------------------------------------

/// How a lease ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    Completed,
    Failed,
    /// Dropped while in use, without `complete` or `fail`.
    Cancelled,
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionExit::Completed => "completed",
            SessionExit::Failed => "failed",
            SessionExit::Cancelled => "cancelled",
        })
    }
}

// -----------------------------------------------------------------------------
// ----- SessionFactory --------------------------------------------------------

pub struct SessionFactory<C: Connector> {
    manager: Arc<ConnectionManager<C>>,
    backoff: Backoff,
    auto_commit: bool,
}

impl<C: Connector> Clone for SessionFactory<C> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            backoff: self.backoff,
            auto_commit: self.auto_commit,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionFactory: Static ------------------------------------------------

impl<C: Connector> SessionFactory<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>) -> Self {
        Self {
            backoff: manager.config().session_backoff(),
            manager,
            auto_commit: false,
        }
    }

    /// Commit on normal exit instead of leaving that to the caller.
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

// -----------------------------------------------------------------------------
// ----- SessionFactory: Public ------------------------------------------------

impl<C: Connector> SessionFactory<C> {
    pub fn manager(&self) -> &Arc<ConnectionManager<C>> {
        &self.manager
    }

    /// Lease a probed session. The guard must be finished with
    /// [`SessionGuard::complete`] or [`SessionGuard::fail`]; dropping it
    /// counts as cancellation.
    ///
    /// Every attempt goes back to the manager for the engine, so an engine
    /// that died after its last validation is rebuilt before the retry.
    pub async fn acquire(&self) -> Result<SessionGuard<ConnectionOf<C>>, DbError> {
        let started = Instant::now();

        let config = self.manager.config();
        let metrics = self.manager.metrics();
        let max_attempts = config.session_max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let engine = self.manager.get_engine().await?;

            match open_probed(engine.pool()).await {
                Ok(conn) => {
                    metrics.increment(Counter::TotalSessions);
                    debug!(generation = engine.generation(), "session acquired");

                    let session = Session::new(conn, engine.generation(), config.echo);
                    return Ok(SessionGuard::new(
                        session,
                        metrics.clone(),
                        started,
                        config.long_session_threshold,
                        self.auto_commit,
                    ));
                }
                Err(e) => {
                    metrics.increment(Counter::ConnectionTestFailures);

                    if attempt + 1 < max_attempts {
                        metrics.increment(Counter::ReconnectAttempts);
                        warn!(
                            "database connection failed (attempt {}/{max_attempts}): {e}",
                            attempt + 1
                        );
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }

                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());

        metrics.increment(Counter::FailedSessions);
        metrics.record_failure(last_error.clone());

        let err = DbError::unavailable(max_attempts, last_error);
        error!("{err}");
        Err(err)
    }

    /// Run `f` inside a leased session.
    ///
    /// `Ok` completes the lease (committing under auto-commit), `Err` fails
    /// it and is returned unchanged. Release happens on every path,
    /// including a panic in `f` or this future being dropped.
    ///
    /// ```ignore
    /// let count = factory
    ///     .scope(|session| {
    ///         Box::pin(async move {
    ///             let out = session.execute("SELECT count(*) FROM pages").await?;
    ///             Ok::<_, DbError>(out.first_value().map(str::to_string))
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn scope<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session<ConnectionOf<C>>) -> ScopeFuture<'s, T, E>,
        E: From<DbError> + fmt::Display,
    {
        let mut guard = self.acquire().await?;

        // A panic in `f` is caught here so the lease is failed (and rolled
        // back) before the panic continues; tokio would otherwise drop the
        // future only after unwinding, which reads as a cancellation.
        let caught = {
            let mut fut = f(&mut *guard);
            poll_fn(|cx| match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(cx))) {
                Ok(Poll::Ready(outcome)) => Poll::Ready(Ok(outcome)),
                Ok(Poll::Pending) => Poll::Pending,
                Err(payload) => Poll::Ready(Err(payload)),
            })
            .await
        };

        match caught {
            Ok(Ok(value)) => {
                guard.complete().await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.fail(&e).await;
                Err(e)
            }
            Err(payload) => {
                let message = format!("session holder panicked: {}", panic_message(&*payload));
                guard.fail(&message).await;
                panic::resume_unwind(payload)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

/// Open a connection and run the probe on it; a connection that fails the
/// probe is closed before the error is returned.
async fn open_probed<P: Pool>(pool: &P) -> Result<P::Connection, BackendError> {
    let mut conn = pool.connect().await?;

    match conn.execute(PROBE_STATEMENT).await {
        Ok(_) => Ok(conn),
        Err(e) => {
            if let Err(close) = conn.close().await {
                debug!("closing half-open connection failed: {close}");
            }
            Err(e)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
