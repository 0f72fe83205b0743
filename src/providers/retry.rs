//! Retry policy and error classification for provider calls.
//!
//! Retriable failures back off exponentially (initial 1 s, doubling, capped
//! at 10 s) except rate limits, which wait a flat 60 s regardless.
//! Authentication, quota, and malformed-input failures are never retried.

use crate::config::RetryConfig;
use crate::providers::circuit::CircuitBreaker;
use crate::providers::ProviderKind;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classified failure kinds for a provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Invalid or missing credentials. Fatal for the affected pipeline.
    Authentication,
    /// Provider quota exhausted.
    QuotaExceeded,
    /// Unknown voice identifier (TTS).
    InvalidVoice,
    /// Malformed or rejected input text.
    InvalidText,
    /// Input text exceeds the provider's limit.
    TextTooLong,
    /// HTTP 429.
    RateLimit,
    /// HTTP 5xx.
    ServerError,
    /// Connection-level failure.
    NetworkError,
    /// Request deadline exceeded.
    Timeout,
}

impl ProviderErrorKind {
    /// Whether an attempt with this failure kind may be retried.
    #[must_use]
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::NetworkError | Self::Timeout
        )
    }

    /// Classify an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            402 => Self::QuotaExceeded,
            429 => Self::RateLimit,
            500..=599 => Self::ServerError,
            _ => Self::InvalidText,
        }
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    /// Failure classification driving retry and circuit decisions.
    pub kind: ProviderErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ProviderError {
    /// Construct a classified failure.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Short human-readable label for client-facing error messages.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Authentication => "authentication failed",
            ProviderErrorKind::QuotaExceeded => "quota exceeded",
            ProviderErrorKind::InvalidVoice => "invalid voice",
            ProviderErrorKind::InvalidText | ProviderErrorKind::TextTooLong => "invalid request",
            ProviderErrorKind::RateLimit => "rate limited",
            ProviderErrorKind::ServerError => "provider error",
            ProviderErrorKind::NetworkError => "network error",
            ProviderErrorKind::Timeout => "timed out",
        }
    }
}

/// Backoff before retry attempt `attempt` (0-based: the wait before the
/// first retry is `backoff_delay(config, 0)`).
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32, kind: ProviderErrorKind) -> Duration {
    if kind == ProviderErrorKind::RateLimit {
        return Duration::from_millis(config.rate_limit_backoff_ms);
    }
    let factor = u64::from(config.multiplier).saturating_pow(attempt);
    let delay = config.initial_backoff_ms.saturating_mul(factor);
    Duration::from_millis(delay.min(config.max_backoff_ms))
}

/// Run a provider call with retry and circuit-breaker accounting.
///
/// The circuit is consulted before every attempt; when it refuses, the call
/// fails immediately with the last error (or a synthetic network error when
/// no attempt was made). Success and failure are reported back to the
/// breaker so circuits trip and recover.
///
/// # Errors
///
/// Returns the final [`ProviderError`] after exhausting attempts, hitting a
/// non-retriable failure, or being refused by the open circuit.
pub async fn call_with_retry<T, F, Fut>(
    provider: ProviderKind,
    config: &RetryConfig,
    breaker: &CircuitBreaker,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_error: Option<ProviderError> = None;

    for attempt in 0..config.max_attempts {
        if !breaker.should_attempt(provider) {
            return Err(last_error.unwrap_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::NetworkError,
                    format!("circuit open for {}", provider.name()),
                )
            }));
        }

        match call().await {
            Ok(value) => {
                breaker.record_success(provider);
                return Ok(value);
            }
            Err(e) => {
                breaker.record_failure(provider);
                let retriable = e.kind.is_retriable();
                warn!(
                    provider = provider.name(),
                    attempt,
                    retriable,
                    "provider call failed: {e}"
                );
                if !retriable || attempt + 1 == config.max_attempts {
                    return Err(e);
                }
                let delay = backoff_delay(config, attempt, e.kind);
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ProviderError::new(ProviderErrorKind::NetworkError, "no attempts made")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            multiplier: 2,
            max_backoff_ms: 4,
            rate_limit_backoff_ms: 5,
        }
    }

    #[test]
    fn classification_matches_policy() {
        assert!(ProviderErrorKind::RateLimit.is_retriable());
        assert!(ProviderErrorKind::ServerError.is_retriable());
        assert!(ProviderErrorKind::NetworkError.is_retriable());
        assert!(ProviderErrorKind::Timeout.is_retriable());
        assert!(!ProviderErrorKind::Authentication.is_retriable());
        assert!(!ProviderErrorKind::QuotaExceeded.is_retriable());
        assert!(!ProviderErrorKind::InvalidVoice.is_retriable());
        assert!(!ProviderErrorKind::InvalidText.is_retriable());
        assert!(!ProviderErrorKind::TextTooLong.is_retriable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ProviderErrorKind::from_status(401),
            ProviderErrorKind::Authentication
        );
        assert_eq!(
            ProviderErrorKind::from_status(429),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::from_status(503),
            ProviderErrorKind::ServerError
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        let kind = ProviderErrorKind::ServerError;
        assert_eq!(
            backoff_delay(&config, 0, kind),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            backoff_delay(&config, 1, kind),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            backoff_delay(&config, 2, kind),
            Duration::from_millis(4_000)
        );
        // Capped at 10 s from attempt 4 onward.
        assert_eq!(
            backoff_delay(&config, 4, kind),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            backoff_delay(&config, 20, kind),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn rate_limit_uses_flat_wait() {
        let config = RetryConfig::default();
        assert_eq!(
            backoff_delay(&config, 0, ProviderErrorKind::RateLimit),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            backoff_delay(&config, 3, ProviderErrorKind::RateLimit),
            Duration::from_millis(60_000)
        );
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let breaker = CircuitBreaker::new(CircuitConfig::default());
        let calls = AtomicU32::new(0);
        let result = call_with_retry(ProviderKind::LlmFast, &retry_config(), &breaker, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::new(ProviderErrorKind::Timeout, "slow"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_fails_immediately() {
        let breaker = CircuitBreaker::new(CircuitConfig::default());
        let calls = AtomicU32::new(0);
        let result: Result<u32, ProviderError> =
            call_with_retry(ProviderKind::Tts, &retry_config(), &breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::new(ProviderErrorKind::Authentication, "bad key")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ProviderErrorKind::Authentication);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_circuit_refuses_without_calling() {
        let breaker = CircuitBreaker::new(CircuitConfig {
            failure_threshold: 1,
            open_secs: 600,
            half_open_probes: 1,
        });
        breaker.record_failure(ProviderKind::Stt);

        let calls = AtomicU32::new(0);
        let result: Result<u32, ProviderError> =
            call_with_retry(ProviderKind::Stt, &retry_config(), &breaker, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
