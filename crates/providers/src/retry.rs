//! Bounded retry with exponential backoff for provider calls.

use ouroboros_config::RetrySettings;
use ouroboros_core::error::ProviderError;
use ouroboros_core::provider::{Decision, Provider, ProviderRequest};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// How many times to call a provider and how long to wait between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (0-based).
    ///
    /// A rate-limit hint from the server overrides a shorter backoff. Every
    /// delay is capped at `max_delay`, hints included.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let backoff = self.base_delay.saturating_mul(factor);
        let delay = match error {
            ProviderError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs))
            }
            _ => backoff,
        };
        delay.min(self.max_delay)
    }
}

/// One failed attempt that was followed by a retry.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number that failed
    pub attempt: u32,
    pub error: ProviderError,
    pub delay: Duration,
}

/// The provider kept failing, or failed in a way retries cannot fix.
#[derive(Debug, Clone, Error)]
#[error("provider failed after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: ProviderError,
    /// Earlier failures that were retried
    pub retried: Vec<RetryAttempt>,
}

/// Call `provider.chat` under `policy`.
///
/// Only transient errors are retried. On success the retried failures are
/// returned alongside the decision so the caller can record them.
pub async fn chat_with_retry(
    provider: &dyn Provider,
    request: &ProviderRequest,
    policy: &RetryPolicy,
) -> Result<(Decision, Vec<RetryAttempt>), RetryExhausted> {
    let mut retried = Vec::new();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match provider.chat(request.clone()).await {
            Ok(decision) => return Ok((decision, retried)),
            Err(error) => error,
        };
        attempt += 1;

        if attempt >= max_attempts || !error.is_transient() {
            return Err(RetryExhausted {
                attempts: attempt,
                last_error: error,
                retried,
            });
        }

        let delay = policy.delay_for(attempt - 1, &error);
        warn!(
            provider = provider.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Provider call failed, retrying after delay"
        );
        retried.push(RetryAttempt {
            attempt,
            error,
            delay,
        });
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the queued errors, then succeeds.
    struct Flaky {
        errors: Mutex<Vec<ProviderError>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(mut errors: Vec<ProviderError>) -> Self {
            errors.reverse();
            Self {
                errors: Mutex::new(errors),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn chat(&self, _request: ProviderRequest) -> Result<Decision, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(Decision::reply("ok")),
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest::new("m", vec![])
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        let err = ProviderError::Network("reset".into());
        assert_eq!(p.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(p.delay_for(2, &err), Duration::from_millis(250));
        assert_eq!(p.delay_for(40, &err), Duration::from_millis(250));
    }

    #[test]
    fn rate_limit_hint_is_honored_up_to_the_cap() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        };
        let limited = ProviderError::RateLimited { retry_after_secs: 2 };
        assert_eq!(p.delay_for(0, &limited), Duration::from_secs(2));

        let hostile = ProviderError::RateLimited { retry_after_secs: 86_400 };
        assert_eq!(p.delay_for(0, &hostile), Duration::from_secs(30));
        assert_eq!(policy().delay_for(0, &limited), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_retry_after_does_not_stall_the_turn() {
        let provider = Flaky::new(vec![ProviderError::RateLimited { retry_after_secs: u64::MAX }]);
        let started = tokio::time::Instant::now();
        let (decision, retried) = chat_with_retry(&provider, &request(), &policy()).await.unwrap();
        assert_eq!(decision.reply.as_deref(), Some("ok"));
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].delay, Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let provider = Flaky::new(vec![
            ProviderError::Network("reset".into()),
            ProviderError::Timeout("slow".into()),
        ]);
        let (decision, retried) = chat_with_retry(&provider, &request(), &policy())
            .await
            .unwrap();
        assert_eq!(decision.reply.as_deref(), Some("ok"));
        assert_eq!(retried.len(), 2);
        assert_eq!(retried[1].delay, Duration::from_millis(200));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let provider = Flaky::new(vec![
            ProviderError::Network("a".into()),
            ProviderError::Network("b".into()),
            ProviderError::Network("c".into()),
            ProviderError::Network("d".into()),
        ]);
        let err = chat_with_retry(&provider, &request(), &policy())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.retried.len(), 2);
        assert!(matches!(err.last_error, ProviderError::Network(ref m) if m == "c"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let provider = Flaky::new(vec![ProviderError::AuthenticationFailed("bad key".into())]);
        let err = chat_with_retry(&provider, &request(), &policy())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(err.retried.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
