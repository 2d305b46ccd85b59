//! Bounded retry with exponential backoff and jitter
//!
//! Only `RateLimited` and `Transient` errors are retried. Each attempt is
//! bounded by `call_timeout`; a timeout counts as `Transient`. Retrying stops
//! at `max_attempts` or when the next sleep would exceed `max_total_wait`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use super::RemoteClient;
use crate::error::{Result, SyncError};
use crate::types::{RemoteBody, RemotePage};

/// Maps the exponential delay for an attempt to the delay actually slept
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Adds up to one second of random jitter
pub fn default_jitter() -> JitterFn {
    Arc::new(|delay| {
        let extra = rand::thread_rng().gen_range(0..1000u64);
        delay + Duration::from_millis(extra)
    })
}

/// Deterministic jitter for tests
pub fn no_jitter() -> JitterFn {
    Arc::new(|delay| delay)
}

/// Retry policy injected into [`RetryingClient`]
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on a single computed backoff (before `Retry-After`)
    pub max_delay: Duration,
    /// Cap on the sum of all sleeps for one call
    pub max_total_wait: Duration,
    /// Bound on each individual attempt
    pub call_timeout: Duration,
    pub jitter: JitterFn,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("max_total_wait", &self.max_total_wait)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_total_wait: Duration::from_secs(120),
            call_timeout: Duration::from_secs(30),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, after `failed_attempts` failures (>= 1)
    pub fn delay_for(&self, failed_attempts: u32, retry_after: Option<u64>) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let delay = (self.jitter)(exponential).min(self.max_delay);

        // Retry-After is a floor, not a suggestion
        match retry_after {
            Some(secs) => delay.max(Duration::from_secs(secs)),
            None => delay,
        }
    }
}

/// Injected sleep so backoff can be observed without waiting
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.slept.lock().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Run `operation` under `policy`, retrying retryable failures
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut waited = Duration::ZERO;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transient(format!(
                "{} timed out after {:?}",
                operation_name, policy.call_timeout
            ))),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let retry_after = match &err {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        let delay = policy.delay_for(attempt, retry_after);
        if waited + delay > policy.max_total_wait {
            tracing::warn!(
                operation = operation_name,
                attempt,
                waited_ms = waited.as_millis() as u64,
                "Retry budget exhausted"
            );
            return Err(err);
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable error, backing off"
        );
        sleeper.sleep(delay).await;
        waited += delay;
    }
}

/// Decorates a [`RemoteClient`] with timeouts and retries
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<C: RemoteClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for RetryingClient<C> {
    async fn get_page(&self, id: &str) -> Result<RemotePage> {
        retry_call(&self.policy, self.sleeper.as_ref(), "get_page", || {
            self.inner.get_page(id)
        })
        .await
    }

    async fn find_page(&self, title: &str, parent_id: Option<&str>) -> Result<Option<RemotePage>> {
        retry_call(&self.policy, self.sleeper.as_ref(), "find_page", || {
            self.inner.find_page(title, parent_id)
        })
        .await
    }

    async fn create_page(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        retry_call(&self.policy, self.sleeper.as_ref(), "create_page", || {
            self.inner.create_page(parent_id, title, body)
        })
        .await
    }

    async fn update_page(
        &self,
        id: &str,
        expected_version: i64,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        retry_call(&self.policy, self.sleeper.as_ref(), "update_page", || {
            self.inner
                .update_page(id, expected_version, parent_id, title, body)
        })
        .await
    }

    async fn upload_attachment(&self, page_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        retry_call(&self.policy, self.sleeper.as_ref(), "upload_attachment", || {
            self.inner.upload_attachment(page_id, filename, bytes)
        })
        .await
    }

    async fn add_labels(&self, page_id: &str, labels: &[String]) -> Result<()> {
        retry_call(&self.policy, self.sleeper.as_ref(), "add_labels", || {
            self.inner.add_labels(page_id, labels)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, RemoteOp};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_total_wait: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            jitter: no_jitter(),
        }
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10, None), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = policy();
        assert_eq!(policy.delay_for(1, Some(3)), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1, Some(0)), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_is_applied() {
        let policy = policy().with_jitter(Arc::new(|d| d + Duration::from_millis(7)));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(107));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_then_succeeds() {
        let remote = Arc::new(InMemoryRemote::new());
        let page = remote.seed_page(None, "Home", "<p/>");
        remote.fail_next(RemoteOp::GetPage, SyncError::RateLimited { retry_after: None });
        remote.fail_next(RemoteOp::GetPage, SyncError::Transient("reset".into()));

        let sleeper = Arc::new(RecordingSleeper::new());
        let client = RetryingClient::new(remote.clone(), policy()).with_sleeper(sleeper.clone());

        let fetched = client.get_page(&page.id).await.unwrap();
        assert_eq!(fetched.id, page.id);
        assert_eq!(remote.calls(RemoteOp::GetPage), 3);
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next(RemoteOp::GetPage, SyncError::Auth("401".into()));

        let sleeper = Arc::new(RecordingSleeper::new());
        let client = RetryingClient::new(remote.clone(), policy()).with_sleeper(sleeper.clone());

        let err = client.get_page("1").await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(remote.calls(RemoteOp::GetPage), 1);
        assert!(sleeper.sleeps().is_empty());

        // Absent pages are decision inputs, not faults
        let err = client.get_page("404").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(remote.calls(RemoteOp::GetPage), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let remote = Arc::new(InMemoryRemote::new());
        for _ in 0..10 {
            remote.fail_next(RemoteOp::FindPage, SyncError::Transient("503".into()));
        }

        let sleeper = Arc::new(RecordingSleeper::new());
        let client = RetryingClient::new(remote.clone(), policy()).with_sleeper(sleeper.clone());

        let err = client.find_page("Home", None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(remote.calls(RemoteOp::FindPage), 4);
        assert_eq!(sleeper.sleeps().len(), 3);
    }

    #[tokio::test]
    async fn test_total_wait_budget_stops_retries() {
        let remote = Arc::new(InMemoryRemote::new());
        for _ in 0..10 {
            remote.fail_next(
                RemoteOp::FindPage,
                SyncError::RateLimited {
                    retry_after: Some(6),
                },
            );
        }

        let sleeper = Arc::new(RecordingSleeper::new());
        let client = RetryingClient::new(remote.clone(), policy()).with_sleeper(sleeper.clone());

        let err = client.find_page("Home", None).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { .. }));
        // 6s fits the 10s budget, a second 6s would not
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(6)]);
        assert_eq!(remote.calls(RemoteOp::FindPage), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_retried() {
        struct Stalling;

        #[async_trait]
        impl Sleeper for Stalling {
            async fn sleep(&self, _duration: Duration) {}
        }

        let policy = RetryPolicy {
            max_attempts: 2,
            call_timeout: Duration::from_millis(20),
            ..policy()
        };

        let mut attempts = 0;
        let result: Result<()> = retry_call(&policy, &Stalling, "stall", || {
            attempts += 1;
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert_eq!(attempts, 2);
    }
}
