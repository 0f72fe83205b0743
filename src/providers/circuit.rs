//! Per-provider circuit breaker.
//!
//! Tracks consecutive failures per provider and temporarily blocks calls to
//! providers that keep failing. After the open duration elapses, a tripped
//! provider enters a half-open state with a small probe budget; a successful
//! probe closes the circuit, a failed probe re-opens it.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  N failures   ┌────────┐  open_secs  ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └────────┘             └────┬─────┘
//!     │                         ▲                      │
//!     │  success                │  failure             │
//!     └─────────────────────────┴──────────────────────┘
//! ```

use crate::config::CircuitConfig;
use crate::providers::ProviderKind;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Circuit state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Provider is healthy — all calls are allowed through.
    Closed,
    /// Provider has failed too many times — calls are blocked until the
    /// open duration expires.
    Open,
    /// Open duration has elapsed — a bounded number of probe calls is
    /// allowed to test recovery.
    HalfOpen,
}

/// Health tracking data for a single provider.
#[derive(Debug, Clone)]
struct ProviderHealth {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// Probe calls remaining while half-open.
    probes_remaining: u32,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probes_remaining: 0,
        }
    }
}

/// Process-global circuit breaker shared by every session.
///
/// Interior mutability behind a [`Mutex`]; all operations are short
/// critical-section map lookups.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    providers: Mutex<HashMap<ProviderKind, ProviderHealth>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given policy.
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful call for the given provider.
    ///
    /// Resets the consecutive failure count and closes the circuit
    /// regardless of previous state.
    pub fn record_success(&self, provider: ProviderKind) {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        let health = providers.entry(provider).or_default();
        health.state = CircuitState::Closed;
        health.consecutive_failures = 0;
        health.probes_remaining = 0;
    }

    /// Record a failed call for the given provider.
    ///
    /// A half-open probe failure re-opens the circuit immediately;
    /// otherwise the failure count must reach the threshold.
    pub fn record_failure(&self, provider: ProviderKind) {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        let health = providers.entry(provider).or_default();
        health.consecutive_failures += 1;
        health.last_failure_at = Some(Instant::now());

        if health.state == CircuitState::HalfOpen
            || health.consecutive_failures >= self.config.failure_threshold
        {
            health.state = CircuitState::Open;
            health.probes_remaining = 0;
        }
    }

    /// Check whether a call to the given provider should be attempted.
    ///
    /// - `Closed`: always `true`
    /// - `Open`: `true` only once the open duration has elapsed (the
    ///   circuit transitions to `HalfOpen` and the probe budget is armed)
    /// - `HalfOpen`: `true` while probes remain in the budget
    pub fn should_attempt(&self, provider: ProviderKind) -> bool {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        let health = providers.entry(provider).or_default();

        match health.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if health.probes_remaining > 0 {
                    health.probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                let open_elapsed = health
                    .last_failure_at
                    .is_none_or(|t| t.elapsed().as_secs() >= self.config.open_secs);

                if open_elapsed {
                    health.state = CircuitState::HalfOpen;
                    health.probes_remaining = self.config.half_open_probes.saturating_sub(1);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current circuit state for a provider.
    #[must_use]
    pub fn state(&self, provider: ProviderKind) -> CircuitState {
        let providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers
            .get(&provider)
            .map_or(CircuitState::Closed, |h| h.state)
    }

    /// Whether calls to the provider are currently blocked.
    ///
    /// Unlike [`Self::should_attempt`] this does not consume a probe.
    #[must_use]
    pub fn is_open(&self, provider: ProviderKind) -> bool {
        self.state(provider) == CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_breaker(threshold: u32, open_secs: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            open_secs,
            half_open_probes: probes,
        })
    }

    #[test]
    fn initial_state_is_closed() {
        let breaker = make_breaker(3, 60, 1);
        assert_eq!(breaker.state(ProviderKind::Tts), CircuitState::Closed);
        assert!(breaker.should_attempt(ProviderKind::Tts));
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = make_breaker(3, 60, 1);
        breaker.record_failure(ProviderKind::LlmFast);
        breaker.record_failure(ProviderKind::LlmFast);
        assert_eq!(breaker.state(ProviderKind::LlmFast), CircuitState::Closed);
    }

    #[test]
    fn trips_to_open_at_threshold() {
        let breaker = make_breaker(3, 600, 1);
        for _ in 0..3 {
            breaker.record_failure(ProviderKind::Tts);
        }
        assert_eq!(breaker.state(ProviderKind::Tts), CircuitState::Open);
        assert!(!breaker.should_attempt(ProviderKind::Tts));
    }

    #[test]
    fn open_transitions_to_half_open_after_cooldown() {
        let breaker = make_breaker(3, 0, 2);
        for _ in 0..3 {
            breaker.record_failure(ProviderKind::Stt);
        }
        // Zero open duration: the first attempt consumes the transition probe.
        assert!(breaker.should_attempt(ProviderKind::Stt));
        assert_eq!(breaker.state(ProviderKind::Stt), CircuitState::HalfOpen);
        // One probe remains in the budget of two.
        assert!(breaker.should_attempt(ProviderKind::Stt));
        // Budget exhausted.
        assert!(!breaker.should_attempt(ProviderKind::Stt));
    }

    #[test]
    fn half_open_success_closes() {
        let breaker = make_breaker(3, 0, 1);
        for _ in 0..3 {
            breaker.record_failure(ProviderKind::LlmDeep);
        }
        assert!(breaker.should_attempt(ProviderKind::LlmDeep));
        breaker.record_success(ProviderKind::LlmDeep);
        assert_eq!(breaker.state(ProviderKind::LlmDeep), CircuitState::Closed);
        assert!(breaker.should_attempt(ProviderKind::LlmDeep));
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = make_breaker(1, 0, 1);
        breaker.record_failure(ProviderKind::Tts); // → Open
        assert!(breaker.should_attempt(ProviderKind::Tts)); // → HalfOpen
        breaker.record_failure(ProviderKind::Tts); // probe failed → Open
        assert_eq!(breaker.state(ProviderKind::Tts), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = make_breaker(3, 60, 1);
        breaker.record_failure(ProviderKind::LlmFast);
        breaker.record_failure(ProviderKind::LlmFast);
        breaker.record_success(ProviderKind::LlmFast);
        breaker.record_failure(ProviderKind::LlmFast);
        breaker.record_failure(ProviderKind::LlmFast);
        // Alternation never reaches three consecutive failures.
        assert_eq!(breaker.state(ProviderKind::LlmFast), CircuitState::Closed);
    }

    #[test]
    fn providers_are_independent() {
        let breaker = make_breaker(2, 600, 1);
        breaker.record_failure(ProviderKind::Tts);
        breaker.record_failure(ProviderKind::Tts);
        assert_eq!(breaker.state(ProviderKind::Tts), CircuitState::Open);
        assert_eq!(breaker.state(ProviderKind::Stt), CircuitState::Closed);
        assert!(breaker.should_attempt(ProviderKind::Stt));
    }

    #[test]
    fn is_open_does_not_consume_probe() {
        let breaker = make_breaker(1, 0, 1);
        breaker.record_failure(ProviderKind::Tts);
        // Open with zero cooldown: is_open reports state without arming probes.
        assert!(breaker.is_open(ProviderKind::Tts));
        assert!(breaker.should_attempt(ProviderKind::Tts));
    }
}
