//! Atomic counters, EMA latency, and bounded per-backend/per-breaker
//! sub-records. `get_metrics()` returns a deep, JSON-encodable snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;

use crate::services::circuit_breaker::CircuitState;

const MAX_BACKEND_ENTRIES: usize = 1000;
const MAX_BREAKER_ENTRIES: usize = 100;
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_connections: i64,
    pub ema_latency_ms: f64,
    pub healthy: bool,
    pub last_health_check_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub state: String,
    pub failure_count: u64,
    pub success_count: u64,
    pub last_state_change_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub breaker_rejected_requests: u64,
    pub ema_latency_ms: f64,
    pub backends: HashMap<String, BackendMetrics>,
    pub breakers: HashMap<String, BreakerMetrics>,
}

struct EmaLatency {
    bits: AtomicU64,
    initialized: std::sync::atomic::AtomicBool,
}

impl EmaLatency {
    fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// CAS loop over the float's bit pattern; the first sample seeds the
    /// EMA directly rather than blending with an arbitrary zero.
    fn record(&self, sample_ms: f64) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            self.bits.store(sample_ms.to_bits(), Ordering::Release);
            return;
        }
        loop {
            let current_bits = self.bits.load(Ordering::Acquire);
            let current = f64::from_bits(current_bits);
            let next = EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * current;
            if self
                .bits
                .compare_exchange_weak(current_bits, next.to_bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

struct BackendEntry {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    active_connections: std::sync::atomic::AtomicI64,
    latency: EmaLatency,
    healthy: std::sync::atomic::AtomicBool,
    last_health_check: AtomicU64,
}

impl BackendEntry {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active_connections: std::sync::atomic::AtomicI64::new(0),
            latency: EmaLatency::new(),
            healthy: std::sync::atomic::AtomicBool::new(true),
            last_health_check: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BackendMetrics {
        BackendMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.success.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            ema_latency_ms: self.latency.value(),
            healthy: self.healthy.load(Ordering::Relaxed),
            last_health_check_unix_ms: self.last_health_check.load(Ordering::Relaxed),
        }
    }
}

struct BreakerEntry {
    state: AtomicU64,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    last_state_change: AtomicU64,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(CircuitState::Closed as u64),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            last_state_change: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BreakerMetrics {
        let state = match self.state.load(Ordering::Relaxed) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        };
        BreakerMetrics {
            state: state.as_str().to_string(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            last_state_change_unix_ms: self.last_state_change.load(Ordering::Relaxed),
        }
    }
}

fn now_unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Process-wide metrics collector. Per-backend and per-breaker maps are
/// bounded; once at the cap, `record_backend`/`record_breaker` silently drop
/// writes for unseen keys rather than growing forever or erroring.
pub struct MetricsCollector {
    start: Instant,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    breaker_rejected_requests: AtomicU64,
    latency: EmaLatency,
    backends: RwLock<HashMap<String, BackendEntry>>,
    breakers: RwLock<HashMap<String, BreakerEntry>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            breaker_rejected_requests: AtomicU64::new(0),
            latency: EmaLatency::new(),
            backends: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_received(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejected(&self) {
        self.breaker_rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, backend: &str, success: bool, latency_ms: f64) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency_ms);
        self.with_backend_entry(backend, |entry| {
            entry.total.fetch_add(1, Ordering::Relaxed);
            if success {
                entry.success.fetch_add(1, Ordering::Relaxed);
            } else {
                entry.failed.fetch_add(1, Ordering::Relaxed);
            }
            entry.latency.record(latency_ms);
        });
    }

    pub fn set_backend_connections(&self, backend: &str, count: i64) {
        self.with_backend_entry(backend, |entry| {
            entry.active_connections.store(count, Ordering::Relaxed);
        });
    }

    pub fn set_backend_health(&self, backend: &str, healthy: bool) {
        self.with_backend_entry(backend, |entry| {
            entry.healthy.store(healthy, Ordering::Relaxed);
            entry.last_health_check.store(now_unix_ms(), Ordering::Relaxed);
        });
    }

    pub fn set_breaker_state(&self, name: &str, state: CircuitState, failure_count: u64, success_count: u64) {
        self.with_breaker_entry(name, |entry| {
            entry.state.store(state as u64, Ordering::Relaxed);
            entry.failure_count.store(failure_count, Ordering::Relaxed);
            entry.success_count.store(success_count, Ordering::Relaxed);
            entry.last_state_change.store(now_unix_ms(), Ordering::Relaxed);
        });
    }

    fn with_backend_entry(&self, name: &str, f: impl FnOnce(&BackendEntry)) {
        {
            let map = self.backends.read().expect("metrics backends lock poisoned");
            if let Some(entry) = map.get(name) {
                f(entry);
                return;
            }
        }
        let mut map = self.backends.write().expect("metrics backends lock poisoned");
        if map.len() >= MAX_BACKEND_ENTRIES && !map.contains_key(name) {
            return; // bounded: silently drop new keys past the cap
        }
        let entry = map.entry(name.to_string()).or_insert_with(BackendEntry::new);
        f(entry);
    }

    fn with_breaker_entry(&self, name: &str, f: impl FnOnce(&BreakerEntry)) {
        {
            let map = self.breakers.read().expect("metrics breakers lock poisoned");
            if let Some(entry) = map.get(name) {
                f(entry);
                return;
            }
        }
        let mut map = self.breakers.write().expect("metrics breakers lock poisoned");
        if map.len() >= MAX_BREAKER_ENTRIES && !map.contains_key(name) {
            return;
        }
        let entry = map.entry(name.to_string()).or_insert_with(BreakerEntry::new);
        f(entry);
    }

    /// Deep copy, uptime computed lazily at call time.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            breaker_rejected_requests: self.breaker_rejected_requests.load(Ordering::Relaxed),
            ema_latency_ms: self.latency.value(),
            backends: self
                .backends
                .read()
                .expect("metrics backends lock poisoned")
                .iter()
                .map(|(k, v)| (k.clone(), v.snapshot()))
                .collect(),
            breakers: self
                .breakers
                .read()
                .expect("metrics breakers lock poisoned")
                .iter()
                .map(|(k, v)| (k.clone(), v.snapshot()))
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
