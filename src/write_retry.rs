// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Bounded retries for writes to the cluster store.
//!
//! A status write carries what this node observed a moment ago, so it is only
//! worth repeating for a few seconds. Rate limiting, server errors and broken
//! connections are retried with a short, jittered exponential delay; after the
//! last attempt the error goes back to the controller, which requeues the VMI.
//!
//! Conflicts (HTTP 409) are returned on the first attempt: the other node wrote
//! in between, and the write must be recomputed from a fresh read.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the second attempt.
const FIRST_DELAY_MILLIS: u64 = 50;

/// Upper bound for a single delay.
const MAX_DELAY_MILLIS: u64 = 2_000;

/// Attempts including the first one.
const MAX_ATTEMPTS: u32 = 8;

/// Share of a delay randomized in both directions.
const JITTER_RATIO: f64 = 0.2;

/// What to do after a failed API call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Transient, try again after a delay.
    Retry,
    /// Optimistic concurrency conflict, re-read before writing again.
    Conflict,
    /// Repeating the same request cannot succeed.
    Permanent,
}

/// Classify a Kubernetes API error.
#[must_use]
pub fn classify(err: &kube::Error) -> Disposition {
    match err {
        kube::Error::Api(api_err) if api_err.code == 409 => Disposition::Conflict,
        kube::Error::Api(api_err) if api_err.code == 429 || (500..600).contains(&api_err.code) => {
            Disposition::Retry
        }
        kube::Error::Service(_) => Disposition::Retry,
        _ => Disposition::Permanent,
    }
}

/// Retry schedule for store writes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteRetry {
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(FIRST_DELAY_MILLIS),
            max_delay: Duration::from_millis(MAX_DELAY_MILLIS),
            max_attempts: MAX_ATTEMPTS,
            jitter: JITTER_RATIO,
        }
    }
}

impl WriteRetry {
    /// Un-jittered delay after the given failed attempt (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter;
        let jittered = rand::rng().random_range((secs - spread).max(0.0)..=secs + spread);
        Duration::from_secs_f64(jittered)
    }

    /// Run `operation` until it succeeds, fails for good, or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, kube::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        let mut attempt = 1;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Store write succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match classify(&err) {
                Disposition::Conflict => {
                    debug!(operation = operation_name, "Store write conflicted, object must be re-read");
                    return Err(err);
                }
                Disposition::Permanent => {
                    warn!(operation = operation_name, error = %err, "Store write failed");
                    return Err(err);
                }
                Disposition::Retry if attempt >= self.max_attempts => {
                    warn!(operation = operation_name, attempt, error = %err, "Store write still failing, giving up");
                    return Err(err);
                }
                Disposition::Retry => {
                    let delay = self.jittered(self.base_delay(attempt));
                    debug!(operation = operation_name, attempt, retry_after = ?delay, error = %err, "Transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
