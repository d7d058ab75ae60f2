//! Backoff and region failover around a single network attempt.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::InferenceError;

/// Exponential backoff parameters. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(30), 3)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    /// A multiplier below 1.0 is clamped to 1.0.
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_interval,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO, 1)
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the retry that follows failed attempt `attempt` (0-based):
    /// `initial * multiplier^attempt`, capped at `max_interval`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_interval
        }
    }
}

/// Ordered regional endpoints with a shared cursor.
#[derive(Debug)]
pub struct RegionSet {
    regions: Vec<String>,
    current: Mutex<usize>,
}

impl RegionSet {
    /// `None` when no region is given.
    pub fn new(regions: Vec<String>) -> Option<Self> {
        if regions.is_empty() {
            return None;
        }
        Some(Self {
            regions,
            current: Mutex::new(0),
        })
    }

    /// Parse a comma-separated list, ignoring blanks.
    pub fn parse(list: &str) -> Option<Self> {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn current_index(&self) -> usize {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> &str {
        &self.regions[self.current_index()]
    }

    /// Advance round-robin and return the new current region.
    pub fn rotate(&self) -> &str {
        let next = {
            let mut idx = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            *idx = (*idx + 1) % self.regions.len();
            *idx
        };
        &self.regions[next]
    }
}

/// How a cancelled token affects an in-flight retry sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancellationMode {
    /// Log and keep going until attempts run out or the operation succeeds.
    /// Streaming callers rely on the sequence finishing for cleanup.
    #[default]
    Continue,
    /// Stop before the next attempt and abort backoff waits.
    Strict,
}

/// Runs an operation under a [`RetryPolicy`], rotating regions on failure
/// when a [`RegionSet`] is attached.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    regions: Option<Arc<RegionSet>>,
    cancellation: CancellationMode,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            regions: None,
            cancellation: CancellationMode::default(),
        }
    }

    pub fn with_regions(mut self, regions: Arc<RegionSet>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn with_cancellation(mut self, mode: CancellationMode) -> Self {
        self.cancellation = mode;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn regions(&self) -> Option<&Arc<RegionSet>> {
        self.regions.as_ref()
    }

    pub fn cancellation(&self) -> CancellationMode {
        self.cancellation
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. Returns the last error on exhaustion.
    ///
    /// The operation receives the 0-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, InferenceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut cancel_logged = false;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                match self.cancellation {
                    CancellationMode::Strict => return Err(InferenceError::Cancelled),
                    CancellationMode::Continue if !cancel_logged => {
                        info!(attempt, "request context cancelled, continuing retry sequence");
                        cancel_logged = true;
                    }
                    CancellationMode::Continue => {}
                }
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if let Some(regions) = &self.regions {
                let failed = regions.current().to_string();
                let next = regions.rotate();
                warn!(region = %failed, next_region = %next, "rotating region after failure");
            }

            if !error.is_retryable() {
                debug!(error = %error, "non-retryable error");
                return Err(error);
            }

            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, error = %error, "retry budget exhausted");
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );

            match self.cancellation {
                CancellationMode::Strict => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                    }
                }
                CancellationMode::Continue => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}
