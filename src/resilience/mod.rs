//! Resilience primitives for outbound calls
//!
//! - Named circuit breakers that fail fast while an upstream is down
//! - Retry with exponential backoff and rate-limit awareness

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use retry::{FailureClass, Retrier, RetryPolicy};
