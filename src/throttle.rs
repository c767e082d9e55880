use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::Level;
use tokio::time::Instant;

use crate::errors::ErrorKind;
use crate::logger::Logger;

struct ThrottleState {
    interval: Duration,
    failures: u32,
    last_allowed: Option<Instant>,
}

/// Adaptive gate in front of one network channel (a target URL).
///
/// The interval starts at the base and doubles on every 429/5xx reported through
/// [`Throttler::handle`], up to the longest acceptable interval. Any 2xx/3xx resets it.
/// An attempt is denied while less than the current interval has elapsed since the last
/// allowed one. A tenth of the base is tolerated so ticks of a timer running at the
/// base period are not lost to jitter.
pub struct Throttler {
    base: Duration,
    longest: Duration,
    target: String,
    state: Mutex<ThrottleState>,
    skips: AtomicU64,
    logger: Logger,
}

impl Throttler {
    /// Creates an open gate. `target` only names the endpoint in log records.
    pub fn new(
        base_interval: Duration,
        longest_acceptable_interval: Duration,
        target: &str,
        logger: Logger,
    ) -> Self {
        Self {
            base: base_interval,
            longest: longest_acceptable_interval.max(base_interval),
            target: target.to_owned(),
            state: Mutex::new(ThrottleState {
                interval: base_interval,
                failures: 0,
                last_allowed: None,
            }),
            skips: AtomicU64::new(0),
            logger,
        }
    }

    /// Decides whether a network attempt may proceed now. Never fails, a denial is
    /// counted and the caller is expected to skip this cycle.
    pub fn perform_action(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        let allowed = match state.last_allowed {
            Some(last) => now.duration_since(last) + self.base / 10 >= state.interval,
            None => true,
        };
        if allowed {
            state.last_allowed = Some(now);
        } else {
            let skipped = self.skips.fetch_add(1, Ordering::SeqCst) + 1;
            log_debug!(
                self.logger,
                "Skipping call to {} (backing off for {:?}, {} skipped so far)",
                self.target,
                state.interval,
                skipped
            );
        }
        allowed
    }

    /// Runs `action` only when the gate allows it.
    pub async fn run<F, Fut, T>(&self, action: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.perform_action() {
            Some(action().await)
        } else {
            None
        }
    }

    /// Feeds the status code of a completed request back into the gate.
    pub fn handle(&self, status_code: u16) {
        let mut state = self.lock();
        match status_code {
            429 | 500..=599 => {
                state.failures = state.failures.saturating_add(1);
                state.interval = state.interval.saturating_mul(2).min(self.longest);
                log_event!(
                    self.logger,
                    Level::Warn,
                    ErrorKind::RetryableHttpResponse,
                    "Received status code {} from {}, backing off to {:?} after {} consecutive failure(s)",
                    status_code,
                    self.target,
                    state.interval,
                    state.failures
                );
            }
            200..=399 => {
                if state.failures > 0 {
                    log_debug!(self.logger, "Call to {} recovered, resetting interval", self.target);
                }
                state.failures = 0;
                state.interval = self.base;
            }
            _ => {}
        }
    }

    /// The interval the gate currently enforces.
    pub fn current_interval(&self) -> Duration {
        self.lock().interval
    }

    /// Number of consecutive 429/5xx responses.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Number of denied attempts since creation.
    pub fn skipped(&self) -> u64 {
        self.skips.load(Ordering::SeqCst)
    }

    /// Name of the guarded endpoint.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
