use std::{
    fmt,
    future::Future,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};
use tokio::{runtime::Handle, time::Instant};
use tracing::{debug, error, warn};

use super::{Session, SessionExit};
use crate::engine::Connection;
use crate::errors::{CleanupError, CleanupStage, DbError};
use crate::metrics::{Counter, Metrics};

// -----------------------------------------------------------------------------
// ----- SessionGuard ----------------------------------------------------------

/// Owns a leased [`Session`] until one of the exits runs.
///
/// Release always runs on a spawned task, so it finishes even when the
/// caller stops polling. `complete` and `fail` wait for it; dropping the
/// guard without either (the owning future was cancelled, or the caller
/// panicked) does not.
///
/// Dropped outside a tokio runtime, the guard cannot release: the
/// connection is dropped without rollback or close, and the drop is
/// counted under cleanup failures.
pub struct SessionGuard<K: Connection> {
    session: Option<Session<K>>,
    lease: Lease,
}

#[derive(Clone)]
struct Lease {
    metrics: Arc<Metrics>,
    started: Instant,
    long_session_threshold: Duration,
    auto_commit: bool,
}

impl<K: Connection> SessionGuard<K> {
    pub(super) fn new(
        session: Session<K>,
        metrics: Arc<Metrics>,
        started: Instant,
        long_session_threshold: Duration,
        auto_commit: bool,
    ) -> Self {
        Self {
            session: Some(session),
            lease: Lease {
                metrics,
                started,
                long_session_threshold,
                auto_commit,
            },
        }
    }

    /// Normal exit. Commits first when auto-commit is on; a failed commit
    /// turns this into a failed exit and is returned.
    pub async fn complete(mut self) -> Result<(), DbError> {
        let committed = match self.session.as_mut() {
            Some(session) if self.lease.auto_commit && !session.is_closed() => {
                session.commit().await
            }
            _ => Ok(()),
        };
        let session = self.take();

        if let Err(e) = committed {
            error!("session commit failed: {e}");
            self.lease.metrics.increment(Counter::FailedSessions);
            self.lease.metrics.record_failure(e.to_string());
            detach(session, self.lease.clone(), SessionExit::Failed).await;
            return Err(e);
        }

        self.lease.metrics.increment(Counter::SuccessfulSessions);
        detach(session, self.lease.clone(), SessionExit::Completed).await;
        Ok(())
    }

    /// Error exit: the open transaction is rolled back. The caller keeps
    /// ownership of `cause` and returns it as-is. Counting and the release
    /// start before the returned future is first polled; awaiting it waits
    /// for the release to finish.
    pub fn fail(mut self, cause: &dyn fmt::Display) -> impl Future<Output = ()> + Send + 'static {
        error!("database session failed: {cause}");
        self.lease.metrics.increment(Counter::FailedSessions);
        self.lease.metrics.record_failure(cause.to_string());

        let session = self.take();
        let lease = self.lease.clone();
        detach(session, lease, SessionExit::Failed)
    }

    fn take(&mut self) -> Session<K> {
        self.session
            .take()
            .expect("session guard missing its session")
    }
}

impl<K: Connection> Deref for SessionGuard<K> {
    type Target = Session<K>;

    fn deref(&self) -> &Session<K> {
        self.session
            .as_ref()
            .expect("session guard missing its session")
    }
}

impl<K: Connection> DerefMut for SessionGuard<K> {
    fn deref_mut(&mut self) -> &mut Session<K> {
        self.session
            .as_mut()
            .expect("session guard missing its session")
    }
}

impl<K: Connection> Drop for SessionGuard<K> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let metrics = &self.lease.metrics;
        let exit = if std::thread::panicking() {
            metrics.increment(Counter::FailedSessions);
            metrics.record_failure("session holder panicked");
            SessionExit::Failed
        } else {
            metrics.increment(Counter::CancelledSessions);
            SessionExit::Cancelled
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release(session, self.lease.clone(), exit));
            }
            Err(_) => {
                warn!("session dropped outside a tokio runtime; connection abandoned");
                metrics.increment(Counter::CleanupFailures);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Release ---------------------------------------------------------------

/// Start the release on its own task and return a future that waits for it.
/// Outside a runtime the release runs inline in the returned future.
fn detach<K: Connection>(
    session: Session<K>,
    lease: Lease,
    exit: SessionExit,
) -> impl Future<Output = ()> + Send + 'static {
    let task = match Handle::try_current() {
        Ok(runtime) => Ok(runtime.spawn(release(session, lease, exit))),
        Err(_) => Err(release(session, lease, exit)),
    };

    async move {
        match task {
            Ok(spawned) => {
                if let Err(e) = spawned.await {
                    warn!("session release task failed: {e}");
                }
            }
            Err(inline) => inline.await,
        }
    }
}

/// Roll back what is still open, close exactly once, then account for the
/// time the lease was held. Failures here are logged, never returned.
async fn release<K: Connection>(mut session: Session<K>, lease: Lease, exit: SessionExit) {
    if session.in_transaction() {
        if let Err(source) = session.rollback_quietly().await {
            report(&lease, CleanupError { stage: CleanupStage::Rollback, source });
        }
    }

    if let Err(source) = session.shutdown().await {
        report(&lease, CleanupError { stage: CleanupStage::Close, source });
    }

    let held = lease.started.elapsed();
    if held > lease.long_session_threshold {
        warn!("long-running database session: {:.2}s", held.as_secs_f64());
        lease.metrics.increment(Counter::LongRunningSessions);
    }

    debug!(exit = %exit, held_ms = held.as_millis() as u64, "session released");
}

fn report(lease: &Lease, err: CleanupError) {
    warn!("{err}");
    lease.metrics.increment(Counter::CleanupFailures);
}
