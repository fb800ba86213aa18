//! End-to-end tests that exercise the dispatcher through real `actix-web`
//! services, including a mock backend reachable over a real TCP socket.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, web, App, HttpResponse};

use helios_core::models::backend::{BackendConfig, TransportConfig};
use helios_core::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use helios_core::services::dispatcher::{dispatch, DispatcherState};
use helios_core::services::health::{ActiveHealthConfig, HealthSupervisor, PassiveHealthConfig};
use helios_core::services::metrics::MetricsCollector;
use helios_core::services::rate_limit::{RateLimiter, RateLimiterConfig};
use helios_core::services::registry::BackendRegistry;

/// Binds to an ephemeral port and spawns a backend that always answers with
/// `status`. Returns the bound address so a test can register it.
async fn spawn_mock_backend(status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = actix_web::HttpServer::new(move || {
        App::new().default_service(web::to(move || {
            let status = actix_web::http::StatusCode::from_u16(status).unwrap();
            async move { HttpResponse::build(status).body("mock") }
        }))
    })
    .listen(listener)
    .unwrap()
    .run();
    actix_rt::spawn(server);
    format!("http://{}", addr)
}

/// Like `spawn_mock_backend` but sleeps `delay` before answering, so tests
/// can exercise the handler deadline.
async fn spawn_slow_backend(delay: Duration, status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = actix_web::HttpServer::new(move || {
        App::new().default_service(web::to(move || async move {
            tokio::time::sleep(delay).await;
            HttpResponse::build(actix_web::http::StatusCode::from_u16(status).unwrap()).body("slow")
        }))
    })
    .listen(listener)
    .unwrap()
    .run();
    actix_rt::spawn(server);
    format!("http://{}", addr)
}

/// Like `spawn_mock_backend` but counts how many requests it has served.
async fn spawn_counting_backend() -> (String, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let counter_clone = counter.clone();
    let server = actix_web::HttpServer::new(move || {
        let counter = counter_clone.clone();
        App::new().default_service(web::to(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                HttpResponse::Ok().body("ok")
            }
        }))
    })
    .listen(listener)
    .unwrap()
    .run();
    actix_rt::spawn(server);
    (format!("http://{}", addr), counter)
}

fn dispatcher_state(
    registry: Arc<BackendRegistry>,
    rate_limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
) -> web::Data<DispatcherState> {
    let metrics = Arc::new(MetricsCollector::new());
    let health = Arc::new(HealthSupervisor::new(
        registry.clone(),
        metrics.clone(),
        ActiveHealthConfig::default(),
        PassiveHealthConfig {
            enabled: true,
            unhealthy_threshold: 3,
            unhealthy_timeout: Duration::from_millis(50),
        },
    ));
    web::Data::new(DispatcherState {
        registry,
        rate_limiter,
        breaker,
        metrics,
        health,
        handler_timeout: Duration::from_secs(30),
    })
}

#[actix_web::test]
async fn passive_health_trips_after_repeated_5xx_then_recovers() {
    let backend_addr = spawn_mock_backend(500).await;
    let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
    registry
        .add(&BackendConfig {
            name: "flaky".into(),
            address: backend_addr,
            weight: None,
        })
        .unwrap();

    let state = dispatcher_state(registry.clone(), None, None);
    let app = test::init_service(App::new().app_data(state.clone()).default_service(web::to(dispatch))).await;

    for _ in 0..3 {
        let req = test::TestRequest::get().uri("/anything").to_request();
        let resp = test::call_service(&app, req).await;
        // The backend's real 500 is passed through to the client; only the
        // passive-health bookkeeping treats it as a failure.
        assert_eq!(resp.status(), 500);
    }

    // The third failure trips the passive threshold (configured to 3); the
    // next request should fail fast with no healthy backend rather than
    // reaching the backend again.
    let req = test::TestRequest::get().uri("/anything").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);

    assert!(!registry.get("flaky").unwrap().raw_healthy());
}

#[actix_web::test]
async fn circuit_breaker_opens_after_failures_and_rejects_fast() {
    let backend_addr = spawn_mock_backend(500).await;
    let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
    registry
        .add(&BackendConfig {
            name: "b".into(),
            address: backend_addr,
            weight: None,
        })
        .unwrap();

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        timeout: Duration::from_millis(50),
        interval: Duration::from_secs(60),
        max_requests: 1,
    }));

    let state = dispatcher_state(registry, None, Some(breaker.clone()));
    let app = test::init_service(App::new().app_data(state.clone()).default_service(web::to(dispatch))).await;

    for _ in 0..2 {
        let req = test::TestRequest::get().uri("/x").to_request();
        let resp = test::call_service(&app, req).await;
        // Real upstream 500 passes through; the breaker still counts it as
        // a failure via the inner `Err`.
        assert_eq!(resp.status(), 500);
    }

    // Breaker should now be open; further calls reject with 503 without
    // touching the backend.
    let req = test::TestRequest::get().uri("/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_web::test]
async fn rate_limiter_returns_429_once_tokens_are_exhausted() {
    let backend_addr = spawn_mock_backend(200).await;
    let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
    registry
        .add(&BackendConfig {
            name: "b".into(),
            address: backend_addr,
            weight: None,
        })
        .unwrap();

    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        max_tokens: 2,
        refill_rate: Duration::from_secs(60),
    }));

    let state = dispatcher_state(registry, Some(limiter), None);
    let app = test::init_service(App::new().app_data(state.clone()).default_service(web::to(dispatch))).await;

    for _ in 0..2 {
        let req = test::TestRequest::get()
            .uri("/x")
            .peer_addr("203.0.113.9:1234".parse().unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
    }

    let req = test::TestRequest::get()
        .uri("/x")
        .peer_addr("203.0.113.9:1234".parse().unwrap())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 429);
}

#[actix_web::test]
async fn strategy_swap_leaves_in_flight_selection_consistent() {
    let (addr_a, calls_a) = spawn_counting_backend().await;
    let (addr_b, calls_b) = spawn_counting_backend().await;

    let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
    registry
        .add(&BackendConfig {
            name: "a".into(),
            address: addr_a,
            weight: None,
        })
        .unwrap();
    registry
        .add(&BackendConfig {
            name: "b".into(),
            address: addr_b,
            weight: None,
        })
        .unwrap();

    let state = dispatcher_state(registry.clone(), None, None);
    let app = test::init_service(App::new().app_data(state.clone()).default_service(web::to(dispatch))).await;

    for _ in 0..4 {
        let req = test::TestRequest::get().uri("/x").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(calls_a.load(Ordering::SeqCst) + calls_b.load(Ordering::SeqCst), 4);

    registry.set_strategy("least_connections").unwrap();
    assert_eq!(registry.strategy_name(), "least_connections");

    let req = test::TestRequest::get().uri("/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn handler_timeout_yields_500_before_backend_responds() {
    let backend_addr = spawn_slow_backend(Duration::from_millis(200), 200).await;
    let registry = Arc::new(BackendRegistry::new("round_robin", TransportConfig::default()).unwrap());
    registry
        .add(&BackendConfig {
            name: "slow".into(),
            address: backend_addr,
            weight: None,
        })
        .unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let health = Arc::new(HealthSupervisor::new(
        registry.clone(),
        metrics.clone(),
        ActiveHealthConfig::default(),
        PassiveHealthConfig::default(),
    ));
    let state = web::Data::new(DispatcherState {
        registry,
        rate_limiter: None,
        breaker: None,
        metrics,
        health,
        handler_timeout: Duration::from_millis(20),
    });

    let app = test::init_service(App::new().app_data(state.clone()).default_service(web::to(dispatch))).await;
    let req = test::TestRequest::get().uri("/x").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
}
