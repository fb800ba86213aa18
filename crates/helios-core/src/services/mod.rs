//! The engine: backend registry, strategies, health supervision, circuit
//! breaking, rate limiting, metrics, the dispatcher, and WebSocket
//! forwarding.
//!
//! ```text
//! ingress -> Dispatcher -> RateLimiter.allow? -> CircuitBreaker.call {
//!     Strategy.select (retry up to 3x against health) -> Backend.client -> upstream
//! } -> MetricsCollector.record -> HealthSupervisor.record_failure (on 5xx)
//! ```
//!
//! An Admin API thread may call into [`registry::BackendRegistry`] at any
//! time; its own mutation lock keeps that safe against the dispatcher's
//! read-mostly hot path.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod strategy;
pub mod websocket;
