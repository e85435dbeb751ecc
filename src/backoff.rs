//! Delay policies inserted between retry attempts.
//!
//! The engine rebuild loop and the session acquisition loop each carry their
//! own policy. Delays are a pure function of the attempt index, so a policy
//! can be inspected (or driven on tokio's paused clock) without sleeping.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// The same delay after every failed attempt.
    Fixed(Duration),
    /// `step * n` after the n-th failed attempt.
    Linear { step: Duration },
    /// `base * 2^i` after the failed attempt with zero-based index `i`.
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay to wait after the failed attempt with zero-based `attempt_index`.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step } => step.saturating_mul(attempt_index.saturating_add(1)),
            Backoff::Exponential { base } => {
                base.saturating_mul(2u32.saturating_pow(attempt_index))
            }
        }
    }

    /// Every delay a loop of `max_attempts` attempts can sleep, in order.
    ///
    /// There is one fewer delay than attempts: nothing is slept after the last.
    pub fn schedule(self, max_attempts: u32) -> impl Iterator<Item = Duration> {
        (0..max_attempts.saturating_sub(1)).map(move |i| self.delay(i))
    }

    /// Sum of the whole schedule; the worst-case time spent sleeping.
    pub fn total(self, max_attempts: u32) -> Duration {
        self.schedule(max_attempts)
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
