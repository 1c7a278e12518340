//! Pacing and retry for mutating remote calls.
//!
//! The hosting platform is eventually consistent: a freshly created fork or
//! commit is not immediately visible to follow-up calls. `Pacer` waits a
//! configured settle interval after those writes and spaces out mutating
//! calls across the whole run. `RetryPolicy` re-invokes transient failures.
//! Both sleep through a `Clock` so tests can run on virtual time.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source used by pacing and retry.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real wall-clock time backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Virtual clock: `sleep` returns immediately, advances `now`, and records
/// the requested duration.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    state: Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            state: Mutex::new(ManualClockState::default()),
        }
    }

    /// Every non-zero sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|s| s.sleeps.clone())
            .unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    /// Move time forward without recording a sleep.
    #[cfg(test)]
    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.elapsed += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self.state.lock().map(|s| s.elapsed).unwrap_or_default();
        self.start + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
    }
}

/// Which write just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleKind {
    Fork,
    Commit,
}

/// Consulted around every mutating remote call.
pub struct Pacer {
    clock: Arc<dyn Clock>,
    settle_after_fork: Duration,
    settle_after_commit: Duration,
    min_interval: Duration,
    /// Earliest instant the next mutation may start. Shared by all pipelines.
    next_slot: tokio::sync::Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(
        clock: Arc<dyn Clock>,
        settle_after_fork: Duration,
        settle_after_commit: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            clock,
            settle_after_fork,
            settle_after_commit,
            min_interval,
            next_slot: tokio::sync::Mutex::new(None),
        }
    }

    /// A pacer that never waits.
    pub fn immediate() -> Self {
        Self::new(
            Arc::new(TokioClock),
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Reserve a slot for a mutating call, waiting if the previous one was
    /// less than `min_interval` ago.
    pub async fn before_mutation(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = {
            let mut slot = self.next_slot.lock().await;
            let now = self.clock.now();
            let start = match *slot {
                Some(at) if at > now => at,
                _ => now,
            };
            *slot = Some(start + self.min_interval);
            start.saturating_duration_since(now)
        };
        self.clock.sleep(wait).await;
    }

    /// Wait out the platform's consistency window after a write.
    pub async fn settle(&self, kind: SettleKind) {
        let wait = match kind {
            SettleKind::Fork => self.settle_after_fork,
            SettleKind::Commit => self.settle_after_commit,
        };
        tracing::debug!(?kind, wait_ms = wait.as_millis() as u64, "settling after remote write");
        self.clock.sleep(wait).await;
    }
}

/// Retry policy for transient remote failures. One attempt means no retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn from_config(section: &crate::config::RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            multiplier: section.multiplier,
        }
    }

    /// Backoff before attempt `attempt` (1-based; attempt 1 never waits).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(0.0).powi(attempt as i32 - 2);
        self.initial_backoff.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(
        &self,
        clock: &dyn Clock,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max && is_transient(&err) => {
                    attempt += 1;
                    let wait = self.backoff_for(attempt);
                    tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying transient failure");
                    clock.sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
