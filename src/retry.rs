//! Retry and bounded polling.
//!
//! Two shapes of waiting show up in a conformance run:
//!
//! - **Retry**: an operation that may fail transiently (API discovery right
//!   after CRDs land, reading the kubeconfig while k3s is still writing it).
//!   These use exponential backoff with jitter and a bounded attempt count.
//! - **Poll**: a readiness condition (API server, subject deployment, subject
//!   endpoint). These use a fixed interval and a hard deadline; every wait in
//!   the harness is bounded.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

/// Backoff configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (must be at least 1)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first success, or the last error once `max_attempts` is spent.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_attempts.max(1) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Observation returned by a polling check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Condition met
    Ready(T),
    /// Condition not met yet; the note (if any) is reported on timeout
    Pending(Option<String>),
}

/// Result type for polling check functions.
///
/// `Err` aborts the wait immediately.
pub type PollResult<T> = Result<Probe<T>, String>;

/// Why a bounded wait ended without the condition being met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed; carries the last pending note
    Timeout {
        /// How long the wait lasted
        waited: Duration,
        /// Last note returned by the check, if any
        last: Option<String>,
    },
    /// The check reported an unrecoverable error
    Aborted(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { waited, last } => {
                write!(f, "timed out after {:?}", waited)?;
                if let Some(last) = last {
                    write!(f, " ({})", last)?;
                }
                Ok(())
            }
            Self::Aborted(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WaitError {}

/// Poll `check` at a fixed interval until it reports ready or `timeout` passes.
///
/// Each check is itself cut off at the deadline, so a hung check cannot stretch
/// the wait. A check that completes without suspending always runs, so a zero
/// timeout still observes the current state.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();
    let mut last = None;

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, check()).await {
            Ok(Ok(Probe::Ready(value))) => return Ok(value),
            Ok(Ok(Probe::Pending(note))) => {
                if note.is_some() {
                    last = note;
                }
            }
            Ok(Err(e)) => return Err(WaitError::Aborted(e)),
            Err(_) => {
                return Err(WaitError::Timeout {
                    waited: start.elapsed(),
                    last: last.or_else(|| Some(format!("{} check did not answer", description))),
                })
            }
        }

        if start.elapsed() + interval > timeout {
            return Err(WaitError::Timeout {
                waited: start.elapsed(),
                last,
            });
        }

        debug!("waiting for {}...", description);
        tokio::time::sleep(interval).await;
    }
}
