//! Exponential backoff retry for blocking network calls.
//!
//! The helper wraps a closure that performs one attempt of an idempotent
//! call. On a retryable failure it sleeps `base_delay * 2^(attempt - 1)`
//! (capped at `max_delay`, jittered) and tries again, up to `max_attempts`
//! times. Non-retryable failures propagate immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How an attempt's failure should be treated by [`retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth sleeping and trying again.
    Retryable,
    /// Fails the whole operation immediately.
    Permanent,
}

/// Backoff policy. Defaults: 7 attempts, 2 second base delay, doubling
/// each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "archiver_duration")]
    pub base_delay: Duration,
    #[serde(with = "archiver_duration")]
    pub max_delay: Duration,
    /// Fractional jitter applied to each computed delay, e.g. `0.1` spreads
    /// delays over `[0.9, 1.1]` of the nominal value.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// The `download_zipfile` helper's tighter default (5 retries).
    pub fn zipfile() -> Self {
        Self {
            max_attempts: 5,
            ..Self::default()
        }
    }

    /// The upload checksum-retry helper's default (7 retries, no backoff
    /// growth beyond the base delay since the remote side just needs a
    /// moment to settle between attempts).
    pub fn checksum_retry() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

/// Compute the delay before the given attempt (1-indexed), including jitter.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let multiplier = multiplier.min(u32::MAX as u64) as u32;
    let nominal = config.base_delay.saturating_mul(multiplier).min(config.max_delay);
    apply_jitter(nominal, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

/// A cheap, cloneable flag checked between attempts so a long-running run
/// can be told to stop without interrupting an in-flight blocking call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors surfaced by [`retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation did not succeed after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("non-retryable error: {0}")]
    NotRetryable(E),
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

/// Run `attempt` up to `config.max_attempts` times, classifying each
/// failure with `classify`. Sleeps between attempts honour `cancel`: if it
/// is set before a sleep would start, the loop stops early.
pub fn retry<T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    classify: impl Fn(&E) -> ErrorClass,
    mut attempt: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, RetryError<E>> {
    let mut last_err = None;
    for n in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: n - 1 });
        }
        match attempt(n) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == ErrorClass::Permanent {
                    return Err(RetryError::NotRetryable(err));
                }
                last_err = Some(err);
                if n < config.max_attempts {
                    std::thread::sleep(calculate_delay(config, n));
                }
            }
        }
    }
    Err(RetryError::Exhausted {
        attempts: config.max_attempts,
        source: last_err.expect("loop runs at least once"),
    })
}

/// Classify a [`reqwest::Error`] (transport-level failure) per the
/// retry/no-retry split in the spec: retry transport errors and timeouts,
/// propagate everything else (e.g. a malformed URL, a TLS build failure).
pub fn classify_transport_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

/// Classify an HTTP response status: retry on 5xx and 429, never retry
/// other 4xx.
pub fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
    if status.is_server_error() || status.as_u16() == 429 {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}
