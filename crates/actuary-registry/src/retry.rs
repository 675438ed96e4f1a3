//! Store call retries and deadlines
//!
//! Every coordination store call made on behalf of an API request runs
//! under the request's `Deadline` and an explicit `RetryPolicy`. Transient
//! store failures are retried with exponential backoff; a call that runs out
//! of attempts or budget surfaces as `Timeout`. Everything else (conflicts,
//! missing leases) is returned on the first occurrence.

use crate::error::{RegistryError, RegistryResult};
use actuary_core::metrics::record_store_operation;
use actuary_core::RetryConfig;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Absolute point in time by which a call must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Original budget in milliseconds
    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    /// Await `fut` until the deadline, mapping expiry to `Timeout`
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> RegistryResult<T>
    where
        F: Future<Output = RegistryResult<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::timeout(operation, self.budget_ms())),
        }
    }
}

/// Bounded exponential-backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts_max: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        assert!(config.attempts_max > 0);
        Self {
            attempts_max: config.attempts_max,
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.multiplier,
        }
    }

    pub fn attempts_max(&self) -> u32 {
        self.attempts_max
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial,
            current_interval: self.initial,
            max_interval: self.max,
            multiplier: self.multiplier,
            // attempts and the deadline bound the loop, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `call` until it succeeds, fails permanently, exhausts its
    /// attempts, or `deadline` passes
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: &Deadline,
        mut call: F,
    ) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let attempts_max = self.attempts_max;
        let mut attempt = 0u32;

        let result = deadline
            .run(
                operation,
                retry(self.backoff(), || {
                    attempt += 1;
                    let current = attempt;
                    let fut = call();
                    async move {
                        let start = Instant::now();
                        let result = fut.await;
                        let elapsed = start.elapsed().as_secs_f64();
                        match result {
                            Ok(value) => {
                                record_store_operation(operation, "success", elapsed);
                                Ok(value)
                            }
                            Err(e) => {
                                record_store_operation(operation, "error", elapsed);
                                if e.is_retriable() && current < attempts_max {
                                    warn!(
                                        operation,
                                        attempt = current,
                                        attempts_max,
                                        error = %e,
                                        "Store call failed, retrying"
                                    );
                                    Err(backoff::Error::transient(e))
                                } else {
                                    Err(backoff::Error::permanent(e))
                                }
                            }
                        }
                    }
                }),
            )
            .await;

        match result {
            Err(e) if e.is_retriable() => {
                warn!(operation, attempts = attempts_max, error = %e, "Store call retries exhausted");
                Err(RegistryError::timeout(operation, deadline.budget_ms()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts_max: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            attempts_max,
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
            multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let result = fast_policy(3)
            .run("put", &deadline, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RegistryError::store("flaky"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_become_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let err = fast_policy(3)
            .run("put", &deadline, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RegistryError::store("down"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let err = fast_policy(3)
            .run("put", &deadline, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RegistryError::PreconditionFailed {
                        key: "k".into(),
                        current: Some(1),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_cuts_slow_call() {
        let deadline = Deadline::after(Duration::from_millis(20));

        let err = fast_policy(3)
            .run("grant_lease", &deadline, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Timeout { ref operation, .. } if operation == "grant_lease"));
    }
}
