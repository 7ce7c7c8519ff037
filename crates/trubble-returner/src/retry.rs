//! Delivery with bounded exponential backoff

use crate::error::TransportError;
use crate::event::JobReturn;
use crate::sink::DeliverySink;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use trubble_common::ReturnerConfig;

/// How often and how patiently a delivery is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy from `returner_retry_max` / `returner_retry_sleep`
    pub fn from_config(config: &ReturnerConfig) -> Self {
        Self {
            max_retries: config.returner_retry_max,
            initial_delay: Duration::from_secs(config.returner_retry_sleep),
            ..Self::default()
        }
    }

    /// One attempt, no retries
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Errors that will not succeed on a later attempt
pub fn is_permanent(error: &TransportError) -> bool {
    match error {
        TransportError::Json(_)
        | TransportError::NotConfigured(_)
        | TransportError::Identity(_) => true,
        TransportError::Status { status, .. } => matches!(status, 400 | 401 | 403),
        _ => false,
    }
}

/// Run `attempt` until it succeeds, fails permanently or `policy` is exhausted
///
/// `endpoint` and `jid` only label log records.
pub async fn with_backoff<F, Fut>(
    policy: &RetryPolicy,
    endpoint: &str,
    jid: &str,
    mut attempt: F,
) -> Result<(), TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Ok(()) => {
                tracing::debug!(endpoint = endpoint, jid = jid, attempts = retries + 1, "Delivered");
                return Ok(());
            }
            Err(e) if retries < policy.max_retries && !is_permanent(&e) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                tracing::info!(
                    endpoint = endpoint,
                    jid = jid,
                    error = %e,
                    "Delivery failed, retrying in {} seconds",
                    delay.as_secs()
                );
                sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = endpoint,
                    jid = jid,
                    attempts = retries + 1,
                    error = %e,
                    "Giving up on delivery"
                );
                return Err(e);
            }
        }
    }
}

/// Deliver `ret`, retrying transport failures per `policy`
///
/// Returns the last error once attempts are exhausted.
pub async fn deliver_with_retry(
    sink: &dyn DeliverySink,
    ret: &JobReturn,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    sink.deliver_retrying(ret, policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then accepts
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
        delivered: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                delivered: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliverySink for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _ret: &JobReturn) -> Result<(), TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(TransportError::Status {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job_return() -> JobReturn {
        JobReturn::new("web1", "nova.top", json!({})).with_retry(true)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(100),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(15));
        assert_eq!(policy.delay_for(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for(3), Duration::from_secs(60));
        assert_eq!(policy.delay_for(4), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_policy_from_config() {
        let config = ReturnerConfig {
            returner_retry_max: 5,
            returner_retry_sleep: 2,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_delivers_once() {
        let sink = Flaky::new(2);
        let policy = RetryPolicy::default();

        let start = tokio::time::Instant::now();
        deliver_with_retry(&sink, &job_return(), &policy).await.unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        // 15s + 30s of backoff on the paused clock
        assert!(start.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let sink = Flaky::new(10);
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };

        let err = deliver_with_retry(&sink, &job_return(), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_attempt() {
        let sink = Flaky::new(1);
        let result = deliver_with_retry(&sink, &job_return(), &RetryPolicy::single_attempt()).await;
        assert!(result.is_err());
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = AtomicU32::new(0);
        let result = with_backoff(&RetryPolicy::default(), "collector", "1", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TransportError::Status {
                    status: 403,
                    message: "bad token".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
