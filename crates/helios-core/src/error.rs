//! Error types surfaced by the dispatch pipeline and the admin mutation API.
//!
//! `HeliosError` covers every caller-visible error named in the error handling
//! design: rate limiting, circuit breaker rejections, backend selection
//! failures, and upstream transport failures. It implements
//! [`actix_web::error::ResponseError`] so handlers can propagate it with `?`
//! and get the right status code and JSON body for free.

use actix_web::{HttpResponse, error::ResponseError, http::StatusCode};
use serde_json::json;

/// Errors the dispatch pipeline or admin API can return to a caller.
#[derive(Debug, thiserror::Error)]
pub enum HeliosError {
    /// The rate limiter rejected this client IP.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The circuit breaker's half-open admission cap was hit.
    #[error("too many requests")]
    TooManyRequests,

    /// The registry has no backends at all.
    #[error("no available backend servers")]
    NoAvailableBackend,

    /// Backends exist but none were healthy after the retry budget.
    #[error("no healthy backend servers available")]
    NoHealthyBackend,

    /// The circuit breaker is open.
    #[error("service temporarily unavailable")]
    CircuitOpen,

    /// An error escaped the breaker guard that wasn't a known sentinel.
    #[error("internal server error")]
    Internal(String),

    /// The upstream transport failed to dial or read from the backend.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Config/admin-mutation errors: invalid URL, unknown strategy, etc.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `set_strategy` or `remove_backend` referenced a name that isn't known.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admin mutation rejected by the IP allow/deny filter.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Admin mutation rejected by the bearer token check.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ResponseError for HeliosError {
    fn status_code(&self) -> StatusCode {
        match self {
            HeliosError::RateLimitExceeded | HeliosError::TooManyRequests => {
                StatusCode::TOO_MANY_REQUESTS
            }
            HeliosError::NoAvailableBackend
            | HeliosError::NoHealthyBackend
            | HeliosError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            HeliosError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HeliosError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            HeliosError::Config(_) => StatusCode::BAD_REQUEST,
            HeliosError::NotFound(_) => StatusCode::NOT_FOUND,
            HeliosError::Forbidden(_) => StatusCode::FORBIDDEN,
            HeliosError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": error_code(self),
            "message": self.to_string(),
        }))
    }
}

fn error_code(err: &HeliosError) -> &'static str {
    match err {
        HeliosError::RateLimitExceeded => "rate_limit_exceeded",
        HeliosError::TooManyRequests => "too_many_requests",
        HeliosError::NoAvailableBackend => "no_available_backend",
        HeliosError::NoHealthyBackend => "no_healthy_backend",
        HeliosError::CircuitOpen => "circuit_open",
        HeliosError::Internal(_) => "internal_error",
        HeliosError::BadGateway(_) => "bad_gateway",
        HeliosError::Config(_) => "invalid_configuration",
        HeliosError::NotFound(_) => "not_found",
        HeliosError::Forbidden(_) => "forbidden",
        HeliosError::Unauthorized(_) => "unauthorized",
    }
}

/// Errors that can escape `CircuitBreaker::call`.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error("too many requests in half-open state")]
    TooManyRequests,
    #[error(transparent)]
    Inner(E),
}
