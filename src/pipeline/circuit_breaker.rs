//! Circuit Breaker for catalog lookups.
//!
//! Stops a scan from hammering an API that has gone away: once
//! `max_consecutive_failures` lookups in a row end unresolved, the breaker
//! trips and stays tripped for the rest of the run.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive unresolved lookups that trip the breaker. 0 disables it.
    pub max_consecutive_failures: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
        }
    }
}

/// Result of recording a lookup outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerResult {
    /// Keep dispatching
    Closed { consecutive_failures: u32 },
    /// Stop dispatching new lookups
    Tripped { consecutive_failures: u32 },
}

/// Consecutive-failure breaker, shared between the dispatcher and the writer.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// A lookup resolved (found or not found).
    pub fn record_success(&self) -> CircuitBreakerResult {
        self.consecutive.store(0, Ordering::SeqCst);
        self.check()
    }

    /// A lookup ended unresolved.
    pub fn record_failure(&self) -> CircuitBreakerResult {
        let failures = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.config.max_consecutive_failures;
        if limit > 0 && failures >= limit && !self.tripped.swap(true, Ordering::SeqCst) {
            log::error!(
                "Circuit breaker: TRIGGERED after {} consecutive failed lookups",
                failures
            );
        }
        self.check()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> CircuitBreakerResult {
        let consecutive_failures = self.consecutive.load(Ordering::SeqCst);
        if self.is_tripped() {
            CircuitBreakerResult::Tripped {
                consecutive_failures,
            }
        } else {
            CircuitBreakerResult::Closed {
                consecutive_failures,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(limit: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            max_consecutive_failures: limit,
        })
    }

    #[test]
    fn test_trips_after_limit() {
        let cb = breaker(3);
        assert!(matches!(cb.record_failure(), CircuitBreakerResult::Closed { .. }));
        assert!(matches!(cb.record_failure(), CircuitBreakerResult::Closed { .. }));
        assert_eq!(
            cb.record_failure(),
            CircuitBreakerResult::Tripped {
                consecutive_failures: 3
            }
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(2);
        cb.record_failure();
        cb.record_success();
        assert_eq!(
            cb.record_failure(),
            CircuitBreakerResult::Closed {
                consecutive_failures: 1
            }
        );
    }

    #[test]
    fn test_trip_is_sticky() {
        let cb = breaker(1);
        cb.record_failure();
        assert!(cb.is_tripped());
        cb.record_success();
        assert!(cb.is_tripped());
    }

    #[test]
    fn test_zero_disables() {
        let cb = breaker(0);
        for _ in 0..100 {
            cb.record_failure();
        }
        assert!(!cb.is_tripped());
    }
}
