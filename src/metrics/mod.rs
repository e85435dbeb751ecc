use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const COUNTER_COUNT: usize = 8;

// -----------------------------------------------------------------------------
// ----- Counter ---------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    TotalSessions,
    SuccessfulSessions,
    FailedSessions,
    ConnectionTestFailures,
    ReconnectAttempts,
    CancelledSessions,
    LongRunningSessions,
    CleanupFailures,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::TotalSessions,
        Counter::SuccessfulSessions,
        Counter::FailedSessions,
        Counter::ConnectionTestFailures,
        Counter::ReconnectAttempts,
        Counter::CancelledSessions,
        Counter::LongRunningSessions,
        Counter::CleanupFailures,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Counter::TotalSessions => "total_sessions",
            Counter::SuccessfulSessions => "successful_sessions",
            Counter::FailedSessions => "failed_sessions",
            Counter::ConnectionTestFailures => "connection_test_failures",
            Counter::ReconnectAttempts => "reconnect_attempts",
            Counter::CancelledSessions => "cancelled_session_count",
            Counter::LongRunningSessions => "long_running_sessions",
            Counter::CleanupFailures => "cleanup_failures",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

// -----------------------------------------------------------------------------
// ----- Metrics ---------------------------------------------------------------

/// Counters shared by the connection manager and the session layer.
///
/// Increments only take the epoch lock shared, so they never contend with each
/// other. `snapshot` and `reset` take it exclusively, which makes both atomic
/// across every counter.
#[derive(Debug, Default)]
pub struct Metrics {
    epoch: RwLock<()>,
    counters: [AtomicU64; COUNTER_COUNT],
    last_failure: Mutex<Option<FailureRecord>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub message: String,
    pub at: SystemTime,
}

// -----------------------------------------------------------------------------
// ----- Metrics: Public -------------------------------------------------------

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let _epoch = self.epoch.read();
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        let record = FailureRecord {
            message: message.into(),
            at: SystemTime::now(),
        };
        let _epoch = self.epoch.read();
        *self.last_failure.lock() = Some(record);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let _epoch = self.epoch.write();
        let failure = self.last_failure.lock().clone();

        MetricsSnapshot {
            total_sessions: self.get(Counter::TotalSessions),
            successful_sessions: self.get(Counter::SuccessfulSessions),
            failed_sessions: self.get(Counter::FailedSessions),
            connection_test_failures: self.get(Counter::ConnectionTestFailures),
            reconnect_attempts: self.get(Counter::ReconnectAttempts),
            cancelled_session_count: self.get(Counter::CancelledSessions),
            long_running_sessions: self.get(Counter::LongRunningSessions),
            cleanup_failures: self.get(Counter::CleanupFailures),
            last_failure: failure.as_ref().map(|f| f.message.clone()),
            last_failure_time: failure.map(|f| f.at),
        }
    }

    pub fn reset(&self) {
        let _epoch = self.epoch.write();
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        *self.last_failure.lock() = None;
    }
}

// -----------------------------------------------------------------------------
// ----- MetricsSnapshot -------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    pub connection_test_failures: u64,
    pub reconnect_attempts: u64,
    pub cancelled_session_count: u64,
    pub long_running_sessions: u64,
    pub cleanup_failures: u64,
    pub last_failure: Option<String>,
    pub last_failure_time: Option<SystemTime>,
}

impl MetricsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::TotalSessions => self.total_sessions,
            Counter::SuccessfulSessions => self.successful_sessions,
            Counter::FailedSessions => self.failed_sessions,
            Counter::ConnectionTestFailures => self.connection_test_failures,
            Counter::ReconnectAttempts => self.reconnect_attempts,
            Counter::CancelledSessions => self.cancelled_session_count,
            Counter::LongRunningSessions => self.long_running_sessions,
            Counter::CleanupFailures => self.cleanup_failures,
        }
    }

    pub fn counters(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        Counter::ALL.into_iter().map(|c| (c.as_str(), self.get(c)))
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.counters() {
            writeln!(f, "{name}={value}")?;
        }

        match &self.last_failure {
            Some(message) => writeln!(f, "last_failure={message}")?,
            None => writeln!(f, "last_failure=")?,
        }

        match self.last_failure_time {
            Some(at) => write!(f, "last_failure_time={}", humantime::format_rfc3339_seconds(at)),
            None => write!(f, "last_failure_time="),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracks_counters_independently() {
        let metrics = Metrics::new();
        metrics.increment(Counter::TotalSessions);
        metrics.increment(Counter::TotalSessions);
        metrics.add(Counter::ReconnectAttempts, 2);
        metrics.add(Counter::FailedSessions, 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_sessions, 2);
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.failed_sessions, 0);
        assert_eq!(snap.get(Counter::TotalSessions), 2);
    }

    #[test]
    fn records_last_failure_with_timestamp() {
        let metrics = Metrics::new();
        let before = SystemTime::now();
        metrics.record_failure("first");
        metrics.record_failure("second");

        let snap = metrics.snapshot();
        assert_eq!(snap.last_failure.as_deref(), Some("second"));
        assert!(snap.last_failure_time.unwrap() >= before);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = Metrics::new();
        for counter in Counter::ALL {
            metrics.add(counter, 3);
        }
        metrics.record_failure("boom");

        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn renders_name_value_lines() {
        let metrics = Metrics::new();
        metrics.increment(Counter::CancelledSessions);

        let text = metrics.snapshot().to_string();
        assert!(text.contains("cancelled_session_count=1\n"));
        assert!(text.contains("total_sessions=0\n"));
        assert!(text.ends_with("last_failure_time="));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment(Counter::ConnectionTestFailures);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.get(Counter::ConnectionTestFailures), 8000);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
