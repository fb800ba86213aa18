//! The Backend Record: per-upstream identity, weight, and runtime health.
//!
//! Backend Records are exclusively owned by the [`crate::services::registry::BackendRegistry`].
//! Every other component (strategies, the health supervisor, the metrics
//! collector, the dispatcher) holds a cloned `Arc<Backend>` — a borrowed
//! handle that stays valid only while the record is admitted into the
//! registry.

use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use url::Url;

use crate::error::HeliosError;

/// Config-time description of a backend, as read from `backends[]` in the
/// YAML file or from an `add_backend` admin mutation.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Snapshot returned by `list_backends` / the admin API — never aliases the
/// live record, so callers can't observe a half-mutated backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub address: String,
    pub healthy: bool,
    pub active_connections: i64,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    healthy: bool,
    unhealthy_until: Option<Instant>,
}

/// Transport timeouts a [`Backend`]'s reqwest client is built with. Mirrors
/// `server.timeouts.backend_*` from the config file.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 100,
        }
    }
}

/// A live upstream: identity, weight, active-connection gauge, health flag,
/// and a pre-configured reverse-proxy transport.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub url: Url,
    pub weight: u32,
    pub active_connections: AtomicI64,
    health: RwLock<HealthState>,
    pub client: reqwest::Client,
    /// Per-strategy smooth-WRR cursor. Only the weighted-round-robin
    /// strategy touches this; everyone else ignores it.
    pub current_weight: AtomicI64,
}

impl Backend {
    /// Builds a new Backend Record. Fails if `cfg.address` isn't a
    /// syntactically valid URL. Weight is clamped to `max(1, cfg.weight)`.
    pub fn new(cfg: &BackendConfig, transport: TransportConfig) -> Result<Self, HeliosError> {
        let url = Url::parse(&cfg.address)
            .map_err(|e| HeliosError::Config(format!("backend '{}': invalid address '{}': {e}", cfg.name, cfg.address)))?;

        let weight = cfg.weight.unwrap_or(1).max(1);

        let client = reqwest::Client::builder()
            .connect_timeout(transport.dial_timeout)
            .timeout(transport.read_timeout)
            .pool_idle_timeout(transport.idle_timeout)
            .pool_max_idle_per_host(transport.max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            name: cfg.name.clone(),
            url,
            weight,
            active_connections: AtomicI64::new(0),
            health: RwLock::new(HealthState {
                healthy: true,
                unhealthy_until: None,
            }),
            client,
            current_weight: AtomicI64::new(0),
        })
    }

    /// `is_healthy` — returns true if `healthy`, or lazily promotes back to
    /// healthy if `now > unhealthy_until`. This is the sole lazy-recovery
    /// path when active probing is disabled.
    pub fn is_healthy(&self) -> bool {
        {
            let state = self.health.read().expect("backend health lock poisoned");
            if state.healthy {
                return true;
            }
            match state.unhealthy_until {
                Some(until) if Instant::now() <= until => return false,
                _ => {}
            }
        }
        // Re-check under exclusive lock before promoting: another thread may
        // have already flipped it, or re-marked it unhealthy.
        let mut state = self.health.write().expect("backend health lock poisoned");
        if state.healthy {
            return true;
        }
        match state.unhealthy_until {
            Some(until) if Instant::now() <= until => false,
            _ => {
                state.healthy = true;
                state.unhealthy_until = None;
                true
            }
        }
    }

    /// Returns the raw healthy flag without lazy promotion. Used by
    /// metrics snapshots where the timeout bookkeeping shouldn't be
    /// triggered just by observing it.
    pub fn raw_healthy(&self) -> bool {
        self.health.read().expect("backend health lock poisoned").healthy
    }

    /// Marks the backend unhealthy for `timeout`.
    pub fn mark_unhealthy(&self, timeout: Duration) {
        let mut state = self.health.write().expect("backend health lock poisoned");
        state.healthy = false;
        state.unhealthy_until = Some(Instant::now() + timeout);
    }

    /// Marks the backend healthy immediately (active probe success).
    pub fn mark_healthy(&self) {
        let mut state = self.health.write().expect("backend health lock poisoned");
        state.healthy = true;
        state.unhealthy_until = None;
    }

    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            name: self.name.clone(),
            address: self.url.to_string(),
            healthy: self.raw_healthy(),
            active_connections: self.connections(),
            weight: self.weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, weight: Option<u32>) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            address: "http://127.0.0.1:9000".to_string(),
            weight,
        }
    }

    #[test]
    fn invalid_url_is_rejected() {
        let bad = BackendConfig {
            name: "a".into(),
            address: "not a url".into(),
            weight: None,
        };
        assert!(Backend::new(&bad, TransportConfig::default()).is_err());
    }

    #[test]
    fn weight_clamped_to_one() {
        let b = Backend::new(&cfg("a", Some(0)), TransportConfig::default()).unwrap();
        assert_eq!(b.weight, 1);
    }

    #[test]
    fn starts_healthy() {
        let b = Backend::new(&cfg("a", None), TransportConfig::default()).unwrap();
        assert!(b.is_healthy());
    }

    #[test]
    fn unhealthy_until_expiry_promotes_lazily() {
        let b = Backend::new(&cfg("a", None), TransportConfig::default()).unwrap();
        b.mark_unhealthy(Duration::from_millis(10));
        assert!(!b.is_healthy());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.is_healthy());
    }

    #[test]
    fn connection_counter_tracks_in_out() {
        let b = Backend::new(&cfg("a", None), TransportConfig::default()).unwrap();
        b.inc_connections();
        b.inc_connections();
        b.dec_connections();
        assert_eq!(b.connections(), 1);
    }
}
