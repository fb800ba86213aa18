//! The Dispatcher: the front-door pipeline that fuses rate limiting, the
//! circuit breaker, strategy selection with retry, and the reverse-proxy
//! forward itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{http::Method, web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use log::warn;

use crate::error::{CircuitBreakerError, HeliosError};
use crate::models::backend::Backend;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::health::HealthSupervisor;
use crate::services::metrics::MetricsCollector;
use crate::services::rate_limit::RateLimiter;
use crate::services::registry::BackendRegistry;
use crate::services::websocket;
use crate::utils::ip::client_ip;

const MAX_SELECTION_ATTEMPTS: usize = 3;

/// Shared state every dispatch handler closes over. One instance per
/// process, held in `web::Data`.
pub struct DispatcherState {
    pub registry: Arc<BackendRegistry>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthSupervisor>,
    /// Deadline for the whole request/response cycle, `server.timeouts.handler`
    /// in the config file. Mirrors the teacher's own per-call
    /// `tokio::time::timeout` wrap, just applied around the whole pipeline
    /// instead of only the upstream send.
    pub handler_timeout: Duration,
}

/// Sentinel error the inner body returns so the breaker counts a failed
/// forward attempt. `Upstream` carries a `HeliosError` straight through to
/// the client (selection failure, dial/read error); `BackendError` wraps a
/// real upstream response (the backend answered, just with a 5xx) that must
/// reach the client verbatim once the breaker has counted it.
enum UpstreamFailure {
    Upstream(HeliosError),
    BackendError(HttpResponse),
}

/// Turns a breaker outcome into the handler's final result. `BackendError`
/// is unwrapped back into `Ok` — the breaker only needed it as an `Err` to
/// count the failure, the client still gets the real upstream response.
fn translate_breaker_result(
    state: &DispatcherState,
    result: Result<HttpResponse, CircuitBreakerError<UpstreamFailure>>,
) -> Result<HttpResponse, HeliosError> {
    match result {
        Ok(response) => Ok(response),
        Err(CircuitBreakerError::Open) => {
            state.metrics.record_breaker_rejected();
            Err(HeliosError::CircuitOpen)
        }
        Err(CircuitBreakerError::TooManyRequests) => {
            state.metrics.record_breaker_rejected();
            Err(HeliosError::TooManyRequests)
        }
        Err(CircuitBreakerError::Inner(UpstreamFailure::Upstream(err))) => Err(err),
        Err(CircuitBreakerError::Inner(UpstreamFailure::BackendError(response))) => Ok(response),
    }
}

/// Drains a request payload stream into an owned buffer. Only used on the
/// plain-HTTP path — the WebSocket-upgrade path must hand `actix_ws::handle`
/// the live, un-consumed stream instead.
async fn collect_body(mut payload: web::Payload) -> Result<web::Bytes, HeliosError> {
    let mut buf = Vec::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| HeliosError::Internal(format!("failed to read request body: {e}")))?;
        buf.extend_from_slice(&chunk);
    }
    Ok(web::Bytes::from(buf))
}

/// Picks a healthy backend, honoring the 3-attempt selection retry budget.
/// A `select` returning `nil` (empty strategy view) fails immediately with
/// `NoAvailableBackend`; an unhealthy pick is retried up to the budget, after
/// which `NoHealthyBackend` is returned.
fn select_healthy_backend(state: &DispatcherState) -> Result<Arc<Backend>, HeliosError> {
    let strategy = state.registry.current_strategy();
    for _ in 0..MAX_SELECTION_ATTEMPTS {
        match strategy.select("") {
            None => return Err(HeliosError::NoAvailableBackend),
            Some(backend) if backend.is_healthy() => return Ok(backend),
            Some(_) => continue,
        }
    }
    Err(HeliosError::NoHealthyBackend)
}

fn select_healthy_backend_for(state: &DispatcherState, client_ip_str: &str) -> Result<Arc<Backend>, HeliosError> {
    let strategy = state.registry.current_strategy();
    for _ in 0..MAX_SELECTION_ATTEMPTS {
        match strategy.select(client_ip_str) {
            None => return Err(HeliosError::NoAvailableBackend),
            Some(backend) if backend.is_healthy() => return Ok(backend),
            Some(_) => continue,
        }
    }
    Err(HeliosError::NoHealthyBackend)
}

/// Entry point registered for all front-door routes. Handles both plain
/// HTTP forwarding and the WebSocket-upgrade hijack path, bounded by the
/// configured handler deadline.
///
/// Only `web::Payload` is extracted here — never `web::Bytes` alongside it.
/// `web::Bytes` buffers (and so consumes) the whole request payload stream
/// before the handler body runs; if that happened here, the WebSocket
/// upgrade branch would hand `actix_ws::handle` an already-drained stream
/// and no client frame would ever arrive. The plain-HTTP path collects its
/// own body from the payload explicitly, after the upgrade check has ruled
/// it out.
pub async fn dispatch(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<DispatcherState>,
) -> Result<HttpResponse, HeliosError> {
    let handler_timeout = state.handler_timeout;
    match tokio::time::timeout(handler_timeout, dispatch_inner(req, payload, state)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("request exceeded handler timeout of {handler_timeout:?}");
            Err(HeliosError::Internal("handler timeout exceeded".into()))
        }
    }
}

async fn dispatch_inner(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<DispatcherState>,
) -> Result<HttpResponse, HeliosError> {
    state.metrics.record_received();

    let ip = client_ip(&req);

    if let Some(limiter) = &state.rate_limiter {
        if !limiter.allow(&ip) {
            state.metrics.record_rate_limited();
            return Err(HeliosError::RateLimitExceeded);
        }
    }

    let is_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_upgrade {
        dispatch_upgrade(req, payload, state, ip).await
    } else {
        let body = collect_body(payload).await?;
        dispatch_http(req, body, state, ip).await
    }
}

async fn dispatch_upgrade(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<DispatcherState>,
    ip: String,
) -> Result<HttpResponse, HeliosError> {
    if let Some(breaker) = &state.breaker {
        let state_ref = state.clone();
        let result = breaker
            .call(|| async move {
                forward_websocket(&req, payload, &state_ref, &ip)
                    .await
                    .map_err(UpstreamFailure::Upstream)
            })
            .await;
        return translate_breaker_result(&state, result);
    }

    forward_websocket(&req, payload, &state, &ip).await
}

async fn dispatch_http(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<DispatcherState>,
    ip: String,
) -> Result<HttpResponse, HeliosError> {
    if let Some(breaker) = &state.breaker {
        let state_ref = state.clone();
        let result = breaker.call(|| async move { forward_http(&req, body, &state_ref, &ip).await }).await;
        return translate_breaker_result(&state, result);
    }

    match forward_http(&req, body, &state, &ip).await {
        Ok(response) => Ok(response),
        Err(UpstreamFailure::Upstream(err)) => Err(err),
        Err(UpstreamFailure::BackendError(response)) => Ok(response),
    }
}

async fn forward_websocket(
    req: &HttpRequest,
    payload: web::Payload,
    state: &DispatcherState,
    ip: &str,
) -> Result<HttpResponse, HeliosError> {
    let backend = select_healthy_backend_for(state, ip)?;
    backend.inc_connections();
    state.metrics.set_backend_connections(&backend.name, backend.connections());
    let result = websocket::proxy_websocket(req, payload, &backend).await;
    backend.dec_connections();
    state.metrics.set_backend_connections(&backend.name, backend.connections());
    result
}

/// Forwards one HTTP request to a selected backend. A dial/read failure
/// becomes `UpstreamFailure::Upstream`; a backend 5xx is still recorded
/// against passive health and the breaker, but is returned as
/// `UpstreamFailure::BackendError` carrying the real response so the caller
/// can pass it through to the client untouched.
async fn forward_http(
    req: &HttpRequest,
    body: web::Bytes,
    state: &DispatcherState,
    ip: &str,
) -> Result<HttpResponse, UpstreamFailure> {
    let backend = select_healthy_backend_for(state, ip).map_err(UpstreamFailure::Upstream)?;

    backend.inc_connections();
    state.metrics.set_backend_connections(&backend.name, backend.connections());

    let started = Instant::now();
    let outcome = forward_once(req, body, &backend).await;

    backend.dec_connections();
    state.metrics.set_backend_connections(&backend.name, backend.connections());

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(response) => {
            let status = response.status().as_u16();
            state.metrics.record_request(&backend.name, status < 500, latency_ms);
            if status >= 500 {
                state.health.record_failure(&backend.name);
                return Err(UpstreamFailure::BackendError(response));
            }
            Ok(response)
        }
        Err(err) => {
            state.metrics.record_request(&backend.name, false, latency_ms);
            warn!("upstream forward to '{}' failed: {}", backend.name, err);
            Err(UpstreamFailure::Upstream(err))
        }
    }
}

/// Forwards the request exactly once (the selection loop only retries
/// picking a backend, never resending the body).
async fn forward_once(req: &HttpRequest, body: web::Bytes, backend: &Backend) -> Result<HttpResponse, HeliosError> {
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut url = backend.url.clone();
    url.set_path(req.uri().path());
    url.set_query(req.uri().query());

    let mut builder = backend.client.request(method, url);

    for (name, value) in req.headers().iter() {
        if name == actix_web::http::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }

    builder = builder.body(body.to_vec());

    let upstream = builder
        .send()
        .await
        .map_err(|e| HeliosError::BadGateway(format!("{e}")))?;

    let status = actix_web::http::StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut response = HttpResponse::build(status);

    for (name, value) in upstream.headers().iter() {
        if name == reqwest::header::TRANSFER_ENCODING || name == reqwest::header::CONNECTION {
            continue;
        }
        if let Ok(v) = value.to_str() {
            response.append_header((name.as_str(), v));
        }
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| HeliosError::BadGateway(format!("{e}")))?;

    Ok(response.body(bytes))
}

/// `GET /v1/health` — unauthenticated liveness probe for the proxy itself.
pub async fn health_endpoint() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn accepts_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE | Method::PATCH | Method::HEAD | Method::OPTIONS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::TransportConfig;
    use crate::services::circuit_breaker::CircuitBreakerConfig;
    use crate::services::health::{ActiveHealthConfig, PassiveHealthConfig};
    use crate::services::rate_limit::RateLimiterConfig;

    fn state_with_backend(healthy: bool) -> DispatcherState {
        let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
        registry
            .add(&crate::models::backend::BackendConfig {
                name: "a".into(),
                address: "http://127.0.0.1:19999".into(),
                weight: None,
            })
            .unwrap();
        if !healthy {
            registry.get("a").unwrap().mark_unhealthy(std::time::Duration::from_secs(60));
        }
        let metrics = Arc::new(MetricsCollector::new());
        let health = Arc::new(HealthSupervisor::new(
            registry.clone(),
            metrics.clone(),
            ActiveHealthConfig::default(),
            PassiveHealthConfig::default(),
        ));
        DispatcherState {
            registry,
            rate_limiter: None,
            breaker: None,
            metrics,
            health,
            handler_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn no_backends_at_all_is_no_available_backend() {
        let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
        let metrics = Arc::new(MetricsCollector::new());
        let health = Arc::new(HealthSupervisor::new(
            registry.clone(),
            metrics.clone(),
            ActiveHealthConfig::default(),
            PassiveHealthConfig::default(),
        ));
        let state = DispatcherState {
            registry,
            rate_limiter: None,
            breaker: None,
            metrics,
            health,
            handler_timeout: Duration::from_secs(30),
        };
        let err = select_healthy_backend(&state).unwrap_err();
        assert!(matches!(err, HeliosError::NoAvailableBackend));
    }

    #[test]
    fn all_unhealthy_after_retries_is_no_healthy_backend() {
        let state = state_with_backend(false);
        let err = select_healthy_backend(&state).unwrap_err();
        assert!(matches!(err, HeliosError::NoHealthyBackend));
    }

    #[test]
    fn healthy_backend_is_selected() {
        let state = state_with_backend(true);
        let backend = select_healthy_backend(&state).unwrap();
        assert_eq!(backend.name, "a");
    }

    #[test]
    fn rate_limiter_blocks_after_budget_exhausted() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 1,
            refill_rate: std::time::Duration::from_secs(60),
        });
        assert!(limiter.allow("9.9.9.9"));
        assert!(!limiter.allow("9.9.9.9"));
    }

    #[test]
    fn breaker_config_defaults_are_sane() {
        let cfg = CircuitBreakerConfig::default();
        assert!(cfg.failure_threshold > 0);
        assert!(cfg.max_requests > 0);
    }
}
