//! Helios reverse proxy and load balancer — process entry point.
//!
//! Loads the YAML config, validates it, wires the registry/health
//! supervisor/circuit breaker/rate limiter/metrics collector into a
//! [`DispatcherState`], and serves it behind `actix-web` until `Ctrl-C`.

mod admin;
mod request_context;

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::dev::Service;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal;

use helios_core::config::settings::{load_config, Config};
use helios_core::config::validate;
use helios_core::logs::configure_logger;
use helios_core::models::backend::{BackendConfig, TransportConfig};
use helios_core::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use helios_core::services::dispatcher::{dispatch, DispatcherState};
use helios_core::services::health::{ActiveHealthConfig, HealthSupervisor, PassiveHealthConfig};
use helios_core::services::metrics::MetricsCollector;
use helios_core::services::rate_limit::{RateLimiter, RateLimiterConfig};
use helios_core::services::registry::BackendRegistry;

/// Helios: a layer-7 reverse proxy and load balancer.
#[derive(Debug, Parser)]
#[command(name = "helios", version, about = "Layer-7 reverse proxy and load balancer")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "helios.yaml")]
    config: String,
}

/// Loads the PEM cert chain and private key named by `server.tls` into a
/// rustls `ServerConfig`. Only called once `validate()` has already
/// confirmed both paths are present.
fn load_tls_config(cert_file: &str, key_file: &str) -> std::io::Result<rustls::ServerConfig> {
    let cert_chain = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;

    let mut pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(std::fs::File::open(key_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = if let Some(key) = pkcs8.pop() {
        rustls::pki_types::PrivateKeyDer::Pkcs8(key)
    } else {
        let mut rsa = rustls_pemfile::rsa_private_keys(&mut std::io::BufReader::new(std::fs::File::open(key_file)?))
            .collect::<Result<Vec<_>, _>>()?;
        let key = rsa
            .pop()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("no private key found in '{key_file}'")))?;
        rustls::pki_types::PrivateKeyDer::Pkcs1(key)
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("invalid TLS cert/key: {e}")))
}

fn transport_config(cfg: &Config) -> TransportConfig {
    TransportConfig {
        dial_timeout: cfg.server.timeouts.backend_dial(),
        read_timeout: cfg.server.timeouts.backend_read(),
        idle_timeout: cfg.server.timeouts.backend_idle(),
        max_idle_per_host: 100,
    }
}

fn build_registry(cfg: &Config) -> Result<BackendRegistry, helios_core::HeliosError> {
    let registry = BackendRegistry::new(&cfg.load_balancer.strategy, transport_config(cfg))?;
    for backend in &cfg.backends {
        registry.add(&BackendConfig {
            name: backend.name.clone(),
            address: backend.address.clone(),
            weight: backend.weight,
        })?;
    }
    Ok(registry)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // rustls 0.23 requires a process-wide default crypto provider before any
    // `ServerConfig` is built; harmless to install even when TLS ends up
    // disabled for this run.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config '{}': {err}", cli.config);
            std::process::exit(1);
        }
    };

    configure_logger(&cfg.logging);
    info!("loaded configuration from '{}'", cli.config);

    let validation = match validate(&cfg) {
        Ok(result) => result,
        Err(err) => {
            error!("configuration is invalid: {err}");
            std::process::exit(1);
        }
    };
    for warning in &validation.warnings {
        warn!("config warning: {warning}");
    }
    for recommendation in &validation.recommendations {
        info!("config recommendation: {recommendation}");
    }

    let registry = match build_registry(&cfg) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!("failed to build backend registry: {err}");
            std::process::exit(1);
        }
    };
    info!(
        "registry initialized with {} backend(s), strategy '{}'",
        cfg.backends.len(),
        cfg.load_balancer.strategy
    );

    let metrics = Arc::new(MetricsCollector::new());

    let active_health = ActiveHealthConfig {
        enabled: cfg.health_checks.active.enabled,
        interval: Duration::from_secs(cfg.health_checks.active.interval),
        timeout: Duration::from_secs(cfg.health_checks.active.timeout),
        path: cfg.health_checks.active.path.clone(),
    };
    let passive_health = PassiveHealthConfig {
        enabled: cfg.health_checks.passive.enabled,
        unhealthy_threshold: cfg.health_checks.passive.unhealthy_threshold,
        unhealthy_timeout: Duration::from_secs(cfg.health_checks.passive.unhealthy_timeout),
    };
    let health = Arc::new(HealthSupervisor::new(
        registry.clone(),
        metrics.clone(),
        active_health,
        passive_health,
    ));
    let mut health_tasks = health.spawn_active_probing();
    if cfg.health_checks.active.enabled {
        info!(
            "active health checks enabled: interval={}s timeout={}s path='{}'",
            cfg.health_checks.active.interval, cfg.health_checks.active.timeout, cfg.health_checks.active.path
        );
    }

    let rate_limiter = if cfg.rate_limit.enabled {
        info!(
            "rate limiting enabled: max_tokens={} refill_rate={}s",
            cfg.rate_limit.max_tokens, cfg.rate_limit.refill_rate_seconds
        );
        Some(Arc::new(RateLimiter::new(RateLimiterConfig {
            max_tokens: cfg.rate_limit.max_tokens,
            refill_rate: Duration::from_secs_f64(cfg.rate_limit.refill_rate_seconds),
        })))
    } else {
        None
    };

    let breaker = if cfg.circuit_breaker.enabled {
        info!("circuit breaker enabled: failure_threshold={}", cfg.circuit_breaker.failure_threshold);
        let breaker_metrics = metrics.clone();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: cfg.circuit_breaker.failure_threshold,
            success_threshold: cfg.circuit_breaker.success_threshold,
            timeout: Duration::from_secs(cfg.circuit_breaker.timeout_seconds),
            interval: Duration::from_secs(cfg.circuit_breaker.interval_seconds),
            max_requests: cfg.circuit_breaker.max_requests,
        })
        .with_callback(Box::new(move |_from, to, failures, successes| {
            // A single aggregate breaker over the whole pool; "pool" is its
            // only key in the per-breaker metrics map.
            breaker_metrics.set_breaker_state("pool", to, failures, successes);
        }));
        Some(Arc::new(breaker))
    } else {
        None
    };

    let dispatcher_state = web::Data::new(DispatcherState {
        registry: registry.clone(),
        rate_limiter,
        breaker,
        metrics: metrics.clone(),
        health: health.clone(),
        handler_timeout: cfg.server.timeouts.handler(),
    });
    let admin_cfg = web::Data::new(cfg.admin_api.clone());
    let logging_cfg = Arc::new(cfg.logging.clone());

    let port = cfg.server.port;
    let admin_enabled = cfg.admin_api.enabled;
    if admin_enabled {
        info!("admin API enabled under /v1");
    } else {
        info!("admin API disabled; /v1/* paths are proxied like any other request");
    }
    let tls_config = if cfg.server.tls.enabled {
        let cert_file = cfg.server.tls.cert_file.as_deref().unwrap_or_default();
        let key_file = cfg.server.tls.key_file.as_deref().unwrap_or_default();
        match load_tls_config(cert_file, key_file) {
            Ok(tls_config) => Some(tls_config),
            Err(err) => {
                error!("failed to load TLS cert/key for server.tls: {err}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };
    info!(
        "starting Helios on port {port} ({})",
        if tls_config.is_some() { "https" } else { "http" }
    );

    let server = HttpServer::new(move || {
        let logging_cfg = logging_cfg.clone();
        let app = App::new()
            .app_data(dispatcher_state.clone())
            .app_data(admin_cfg.clone())
            .wrap(actix_web::middleware::Logger::default())
            .wrap_fn(move |req, srv| {
                let logging_cfg = logging_cfg.clone();
                let request_id = request_context::resolve_id(
                    &req,
                    &logging_cfg.request_id.header,
                    logging_cfg.request_id.enabled,
                );
                let trace_id =
                    request_context::resolve_id(&req, &logging_cfg.trace.header, logging_cfg.trace.enabled);
                request_context::stash_request_id(&req, request_id.clone());
                let method = req.method().clone();
                let path = req.path().to_string();
                let started = Instant::now();

                let fut = srv.call(req);
                async move {
                    let mut res = fut.await?;
                    if let Some(id) = &request_id {
                        request_context::set_response_header(&mut res, &logging_cfg.request_id.header, id);
                    }
                    if let Some(id) = &trace_id {
                        request_context::set_response_header(&mut res, &logging_cfg.trace.header, id);
                    }
                    if request_id.is_some() || trace_id.is_some() {
                        info!(
                            "{method} {path} -> {} ({:?}) request_id={} trace_id={}",
                            res.status(),
                            started.elapsed(),
                            request_id.as_deref().unwrap_or("-"),
                            trace_id.as_deref().unwrap_or("-"),
                        );
                    }
                    Ok(res)
                }
            });
        if admin_enabled {
            app.configure(admin::configure_admin).default_service(web::to(dispatch))
        } else {
            app.default_service(web::to(dispatch))
        }
    })
    .client_request_timeout(cfg.server.timeouts.read())
    .client_disconnect_timeout(cfg.server.timeouts.write())
    .keep_alive(cfg.server.timeouts.idle());

    let server = match tls_config {
        Some(tls_config) => server.bind_rustls_0_23(("0.0.0.0", port), tls_config)?,
        None => server.bind(("0.0.0.0", port))?,
    }
    .run();

    let shutdown_timeout = cfg.server.timeouts.shutdown();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped"),
                Err(err) => error!("server error: {err}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, draining outstanding work (timeout {:?})", shutdown_timeout);
        }
    }

    health.shutdown();
    let _ = tokio::time::timeout(shutdown_timeout, async {
        while health_tasks.join_next().await.is_some() {}
    })
    .await;

    info!("shutdown complete");
    Ok(())
}
