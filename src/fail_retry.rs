// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Exponential backoff for reconciliations that keep failing for the same reason.
//!
//! The reconciliation queue already retries a failed key with its own rate
//! limiting. This engine sits on top of it: the first failure of a key is left to
//! the queue, but a failure that follows the previous attempt within
//! `max_fail_response_time` is considered the same underlying problem and the key
//! is held back for a growing interval (`initial_wait`, doubled up to `max_wait`).
//!
//! # Example
//!
//! ```rust
//! use handoff::fail_retry::FailRetryManager;
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let manager = FailRetryManager::new(
//!     "io-error-retry",
//!     Duration::from_secs(10),
//!     Duration::from_secs(180),
//!     Duration::from_secs(30),
//! );
//! let start = Instant::now();
//!
//! // First failure: let the caller retry on its own schedule
//! assert_eq!(manager.should_delay_at("default/vmi", true, start), (false, Duration::ZERO));
//!
//! // Same failure one second later: back off until the scheduled retry
//! let (delay, wait) = manager.should_delay_at("default/vmi", true, start + Duration::from_secs(1));
//! assert!(delay);
//! assert_eq!(wait, Duration::from_secs(9));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Backoff bookkeeping for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    /// Start of the current failure episode
    pub first_fail: Instant,
    /// Last time the caller was allowed to run
    pub last_run: Instant,
    /// Earliest time the caller may run again
    pub next_run: Instant,
    /// Current backoff interval
    pub wait_interval: Duration,
    /// The key is currently held back
    pub last_run_failed: bool,
}

impl RetryState {
    fn new_episode(now: Instant, initial_wait: Duration) -> Self {
        Self {
            first_fail: now,
            last_run: now,
            next_run: now + initial_wait,
            wait_interval: initial_wait,
            last_run_failed: false,
        }
    }
}

/// Per-key failure throttling.
pub struct FailRetryManager {
    name: String,
    initial_wait: Duration,
    max_wait: Duration,
    max_fail_response_time: Duration,
    states: Mutex<HashMap<String, RetryState>>,
}

impl FailRetryManager {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        initial_wait: Duration,
        max_wait: Duration,
        max_fail_response_time: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            initial_wait,
            max_wait,
            max_fail_response_time,
            states: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requeue delay for the first failure of an episode.
    ///
    /// At most half the response window, so a repeat of the failure is still
    /// attributed to the same episode and backed off.
    #[must_use]
    pub fn first_retry_delay(&self) -> Duration {
        self.initial_wait.min(self.max_fail_response_time / 2)
    }

    /// Remaining backoff of `key`, or `None` when it may run now.
    ///
    /// Called before every attempt. Once the backoff of a held-back key has
    /// elapsed the key is let through and its next interval doubles.
    #[must_use]
    pub fn hold_back(&self, key: &str) -> Option<Duration> {
        self.hold_back_at(key, Instant::now())
    }

    /// Same as [`FailRetryManager::hold_back`] with an explicit clock.
    #[must_use]
    pub fn hold_back_at(&self, key: &str, now: Instant) -> Option<Duration> {
        delayed(self.should_delay_at(key, false, now))
    }

    /// Record a failed attempt of `key`.
    ///
    /// Returns the backoff when the failure repeats a recent one, `None` when it
    /// starts a new episode.
    pub fn record_failure(&self, key: &str) -> Option<Duration> {
        self.record_failure_at(key, Instant::now())
    }

    /// Same as [`FailRetryManager::record_failure`] with an explicit clock.
    pub fn record_failure_at(&self, key: &str, now: Instant) -> Option<Duration> {
        delayed(self.should_delay_at(key, true, now))
    }

    /// Decide whether `key` must be held back, evaluating `is_failure` only when needed.
    ///
    /// Returns `(true, delay)` when the caller should wait `delay` before retrying.
    pub fn should_delay(&self, key: &str, is_failure: impl FnOnce() -> bool) -> (bool, Duration) {
        let now = Instant::now();
        let in_backoff = self
            .lock()
            .get(key)
            .is_some_and(|state| state.last_run_failed);
        // A key in backoff is decided by time alone
        let failed = !in_backoff && is_failure();
        self.should_delay_at(key, failed, now)
    }

    /// Same as [`FailRetryManager::should_delay`] with an explicit clock.
    pub fn should_delay_at(&self, key: &str, failed: bool, now: Instant) -> (bool, Duration) {
        let mut states = self.lock();

        let Some(state) = states.get_mut(key) else {
            if failed {
                debug!(engine = %self.name, key, "First failure recorded, not delaying");
                states.insert(key.to_string(), RetryState::new_episode(now, self.initial_wait));
            }
            return (false, Duration::ZERO);
        };

        if state.last_run_failed {
            if now < state.next_run {
                return (true, state.next_run - now);
            }
            state.wait_interval = (state.wait_interval * 2).min(self.max_wait);
            state.next_run = now + state.wait_interval;
            state.last_run = now;
            state.last_run_failed = false;
            debug!(
                engine = %self.name,
                key,
                next_wait = ?state.wait_interval,
                "Backoff elapsed, allowing retry"
            );
            return (false, Duration::ZERO);
        }

        if !failed {
            return (false, Duration::ZERO);
        }

        if now < state.last_run + self.max_fail_response_time {
            state.last_run_failed = true;
            if state.next_run <= now {
                state.next_run = now + state.wait_interval;
            }
            let delay = state.next_run - now;
            info!(engine = %self.name, key, delay = ?delay, "Repeated failure, backing off");
            return (true, delay);
        }

        debug!(engine = %self.name, key, "Failure outside the response window, new episode");
        *state = RetryState::new_episode(now, self.initial_wait);
        (false, Duration::ZERO)
    }

    /// Snapshot of the state tracked for `key`.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<RetryState> {
        self.lock().get(key).copied()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Forget keys that have been quiet for longer than the response window.
    ///
    /// Keys currently held back are kept. Returns the number of removed keys.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, state| {
            state.last_run_failed
                || now.saturating_duration_since(state.last_run) <= self.max_fail_response_time
        });
        before - states.len()
    }

    /// Sweep stale keys every `max_wait` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.max_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            engine = %self.name,
            interval_secs = self.max_wait.as_secs(),
            "Retry engine sweep started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(engine = %self.name, "Retry engine sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep_at(Instant::now());
                    if removed > 0 {
                        debug!(engine = %self.name, removed, "Swept quiet retry keys");
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn delayed((delay, wait): (bool, Duration)) -> Option<Duration> {
    delay.then_some(wait)
}
