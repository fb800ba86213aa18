//! Health Supervisor: periodic active probes plus passive 5xx counting,
//! toggling Backend Record health via the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::task::JoinSet;

use crate::services::metrics::MetricsCollector;
use crate::services::registry::BackendRegistry;

#[derive(Debug, Clone)]
pub struct ActiveHealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub path: String,
}

impl Default for ActiveHealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PassiveHealthConfig {
    pub enabled: bool,
    pub unhealthy_threshold: u32,
    pub unhealthy_timeout: Duration,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unhealthy_threshold: 5,
            unhealthy_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the passive failure counters (one per backend name, under its own
/// exclusive lock) and, when enabled, spawns the active-probe ticker.
pub struct HealthSupervisor {
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsCollector>,
    active: ActiveHealthConfig,
    passive: PassiveHealthConfig,
    failure_counts: RwLock<HashMap<String, u32>>,
    /// When each backend was last actively probed. Consulted before firing a
    /// new probe so a backend that was just checked (e.g. by a passive
    /// failure racing the ticker) isn't probed again before `active.interval`
    /// has elapsed.
    last_probed: RwLock<HashMap<String, Instant>>,
    shutdown: Arc<AtomicBool>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsCollector>,
        active: ActiveHealthConfig,
        passive: PassiveHealthConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            active,
            passive,
            failure_counts: RwLock::new(HashMap::new()),
            last_probed: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Called by the dispatcher when a backend's response status is >= 500.
    /// Reaching `unhealthy_threshold` marks the backend unhealthy and resets
    /// the counter to 0.
    pub fn record_failure(&self, backend_name: &str) {
        if !self.passive.enabled {
            return;
        }
        let tripped = {
            let mut counts = self.failure_counts.write().expect("health counters lock poisoned");
            let counter = counts.entry(backend_name.to_string()).or_insert(0);
            *counter += 1;
            if *counter >= self.passive.unhealthy_threshold {
                *counter = 0;
                true
            } else {
                false
            }
        };

        if tripped {
            if let Some(backend) = self.registry.get(backend_name) {
                backend.mark_unhealthy(self.passive.unhealthy_timeout);
                warn!(
                    "backend '{}' marked unhealthy after {} consecutive failures",
                    backend_name, self.passive.unhealthy_threshold
                );
                self.metrics.set_backend_health(backend_name, false);
            }
        }
    }

    /// Spawns the active-probe ticker if enabled. Returns a `JoinSet` the
    /// caller can join at shutdown; `shutdown()` signals probes to stop
    /// spawning new work.
    pub fn spawn_active_probing(self: &Arc<Self>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        if !self.active.enabled {
            return tasks;
        }

        let supervisor = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.active.interval);
            loop {
                ticker.tick().await;
                if supervisor.shutdown.load(Ordering::Acquire) {
                    return;
                }
                supervisor.probe_all();
            }
        });
        tasks
    }

    /// True if `backend_name` was probed within the active-check interval
    /// and so a fresh probe would be redundant. Also stamps the name as
    /// probed-now when it returns `false`, so callers don't need a second
    /// write under the same lock.
    fn recently_probed(&self, backend_name: &str) -> bool {
        let now = Instant::now();
        let mut probed = self.last_probed.write().expect("health probe-time lock poisoned");
        match probed.get(backend_name) {
            Some(last) if now.duration_since(*last) < self.active.interval => true,
            _ => {
                probed.insert(backend_name.to_string(), now);
                false
            }
        }
    }

    fn probe_all(self: &Arc<Self>) {
        for backend in self.registry.snapshot() {
            if self.recently_probed(&backend.name) {
                debug!("skipping active probe for backend '{}', checked recently", backend.name);
                continue;
            }
            let supervisor = self.clone();
            tokio::spawn(async move {
                if supervisor.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let url = format!(
                    "{}{}",
                    backend.url.as_str().trim_end_matches('/'),
                    supervisor.active.path
                );
                let result = backend
                    .client
                    .get(&url)
                    .timeout(supervisor.active.timeout)
                    .send()
                    .await;

                match result {
                    Ok(resp) if resp.status().is_success() => {
                        let was_unhealthy = !backend.raw_healthy();
                        backend.mark_healthy();
                        if was_unhealthy {
                            debug!("backend '{}' recovered (active probe)", backend.name);
                        }
                        supervisor.metrics.set_backend_health(&backend.name, true);
                    }
                    Ok(resp) => {
                        backend.mark_unhealthy(supervisor.passive.unhealthy_timeout);
                        warn!(
                            "active probe for backend '{}' returned status {}",
                            backend.name,
                            resp.status()
                        );
                        supervisor.metrics.set_backend_health(&backend.name, false);
                    }
                    Err(err) => {
                        backend.mark_unhealthy(supervisor.passive.unhealthy_timeout);
                        warn!("active probe for backend '{}' failed: {}", backend.name, err);
                        supervisor.metrics.set_backend_health(&backend.name, false);
                    }
                }
            });
        }
    }

    /// Signals the supervisor to stop. Outstanding probes already in flight
    /// still complete; callers join the `JoinSet` returned by
    /// `spawn_active_probing` to wait for that.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
