//! Pluggable backend-selection strategies.
//!
//! Each strategy owns its own view of the live backend list — a `Vec<Arc<Backend>>`
//! behind a readers-writer lock, populated by the registry's `add`/`remove` and
//! re-seeded wholesale on a `set_strategy` swap. Selection never blocks on I/O
//! and never takes more than the strategy's own lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::models::Backend;
use crate::utils::hash::{fnv1a_32, jump_consistent_hash};

/// Capability set every strategy implements. Adding a new strategy means
/// adding a new impl of this trait — the dispatcher never needs to change.
pub trait Strategy: Send + Sync + std::fmt::Debug {
    /// Picks a backend candidate for `client_ip`. Returns `None` if the
    /// strategy's backend list is empty. Does not itself filter unhealthy
    /// backends unless the algorithm requires it (weighted-RR and IP-hash
    /// variants restrict themselves to the healthy subset; round-robin and
    /// least-connections do not — the dispatcher retries on an unhealthy pick).
    fn select(&self, client_ip: &str) -> Option<Arc<Backend>>;

    fn add(&self, backend: Arc<Backend>);

    fn remove(&self, name: &str);

    /// Replaces the whole view, used when a new strategy is seeded from the
    /// previous one during `set_strategy`.
    fn seed(&self, backends: Vec<Arc<Backend>>);

    fn list(&self) -> Vec<Arc<Backend>>;

    fn strategy_name(&self) -> &'static str;
}

fn healthy_subset(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    backends.iter().filter(|b| b.is_healthy()).cloned().collect()
}

/// Atomic increment of a 64-bit counter modulo backend count.
#[derive(Debug, Default)]
pub struct RoundRobin {
    backends: RwLock<Vec<Arc<Backend>>>,
    cursor: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn select(&self, _client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.backends.read().expect("round robin lock poisoned");
        if backends.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % backends.len();
        Some(backends[idx].clone())
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends.write().expect("round robin lock poisoned").push(backend);
    }

    fn remove(&self, name: &str) {
        self.backends
            .write()
            .expect("round robin lock poisoned")
            .retain(|b| b.name != name);
    }

    fn seed(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("round robin lock poisoned") = backends;
    }

    fn list(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("round robin lock poisoned").clone()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Linear scan for the minimum `active_connections`. Ties broken by
/// first-encountered order.
#[derive(Debug, Default)]
pub struct LeastConnections {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for LeastConnections {
    fn select(&self, _client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.backends.read().expect("least connections lock poisoned");
        backends
            .iter()
            .min_by_key(|b| b.connections())
            .cloned()
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends
            .write()
            .expect("least connections lock poisoned")
            .push(backend);
    }

    fn remove(&self, name: &str) {
        self.backends
            .write()
            .expect("least connections lock poisoned")
            .retain(|b| b.name != name);
    }

    fn seed(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("least connections lock poisoned") = backends;
    }

    fn list(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .expect("least connections lock poisoned")
            .clone()
    }

    fn strategy_name(&self) -> &'static str {
        "least_connections"
    }
}

/// Nginx-style smooth weighted round robin. `mutation` serializes the
/// current_weight dance across concurrent selections; the backend list
/// itself is read-locked for the duration.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    backends: RwLock<Vec<Arc<Backend>>>,
    mutation: Mutex<()>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for WeightedRoundRobin {
    fn select(&self, _client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.backends.read().expect("weighted rr lock poisoned");
        let healthy = healthy_subset(&backends);
        if healthy.is_empty() {
            return None;
        }

        let _guard = self.mutation.lock().expect("weighted rr mutation poisoned");
        let total: i64 = healthy.iter().map(|b| b.weight as i64).sum();

        let mut winner: Option<(&Arc<Backend>, i64)> = None;
        for b in &healthy {
            let cw = b.current_weight.fetch_add(b.weight as i64, Ordering::AcqRel) + b.weight as i64;
            match winner {
                Some((_, best)) if cw <= best => {}
                _ => winner = Some((b, cw)),
            }
        }

        let (chosen, _) = winner?;
        chosen.current_weight.fetch_sub(total, Ordering::AcqRel);
        Some(chosen.clone())
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends.write().expect("weighted rr lock poisoned").push(backend);
    }

    fn remove(&self, name: &str) {
        self.backends
            .write()
            .expect("weighted rr lock poisoned")
            .retain(|b| b.name != name);
    }

    fn seed(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("weighted rr lock poisoned") = backends;
    }

    fn list(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("weighted rr lock poisoned").clone()
    }

    fn strategy_name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

fn hash_index(client_ip: &str, count: u32, consistent: bool) -> u32 {
    let hash = fnv1a_32(client_ip.as_bytes());
    if consistent {
        jump_consistent_hash(hash as u64, count)
    } else {
        hash % count
    }
}

/// FNV-1a hash of the client IP, modulo the healthy count.
#[derive(Debug, Default)]
pub struct IpHash {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl IpHash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for IpHash {
    fn select(&self, client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.backends.read().expect("ip hash lock poisoned");
        let healthy = healthy_subset(&backends);
        if healthy.is_empty() {
            return None;
        }
        let idx = hash_index(client_ip, healthy.len() as u32, false) as usize;
        Some(healthy[idx].clone())
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends.write().expect("ip hash lock poisoned").push(backend);
    }

    fn remove(&self, name: &str) {
        self.backends.write().expect("ip hash lock poisoned").retain(|b| b.name != name);
    }

    fn seed(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("ip hash lock poisoned") = backends;
    }

    fn list(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("ip hash lock poisoned").clone()
    }

    fn strategy_name(&self) -> &'static str {
        "ip_hash"
    }
}

/// Same IP extraction and FNV-1a hash as [`IpHash`], but the bucket is chosen
/// with Jump Consistent Hash for minimal remapping when the healthy count
/// changes.
#[derive(Debug, Default)]
pub struct IpHashConsistent {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl IpHashConsistent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for IpHashConsistent {
    fn select(&self, client_ip: &str) -> Option<Arc<Backend>> {
        let backends = self.backends.read().expect("ip hash consistent lock poisoned");
        let healthy = healthy_subset(&backends);
        if healthy.is_empty() {
            return None;
        }
        let idx = hash_index(client_ip, healthy.len() as u32, true) as usize;
        Some(healthy[idx].clone())
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends
            .write()
            .expect("ip hash consistent lock poisoned")
            .push(backend);
    }

    fn remove(&self, name: &str) {
        self.backends
            .write()
            .expect("ip hash consistent lock poisoned")
            .retain(|b| b.name != name);
    }

    fn seed(&self, backends: Vec<Arc<Backend>>) {
        *self.backends.write().expect("ip hash consistent lock poisoned") = backends;
    }

    fn list(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .expect("ip hash consistent lock poisoned")
            .clone()
    }

    fn strategy_name(&self) -> &'static str {
        "ip_hash_consistent"
    }
}

/// Builds a fresh strategy instance by name, matching `load_balancer.strategy`
/// in the config file plus the `ip_hash_consistent` extension.
pub fn build(name: &str) -> Result<Box<dyn Strategy>, crate::error::HeliosError> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::new())),
        "least_connections" => Ok(Box::new(LeastConnections::new())),
        "weighted_round_robin" => Ok(Box::new(WeightedRoundRobin::new())),
        "ip_hash" => Ok(Box::new(IpHash::new())),
        "ip_hash_consistent" => Ok(Box::new(IpHashConsistent::new())),
        other => Err(crate::error::HeliosError::Config(format!(
            "unknown load balancing strategy '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{BackendConfig, TransportConfig};
    use std::collections::HashMap;

    fn backend(name: &str, weight: u32) -> Arc<Backend> {
        Arc::new(
            Backend::new(
                &BackendConfig {
                    name: name.to_string(),
                    address: "http://127.0.0.1:9000".to_string(),
                    weight: Some(weight),
                },
                TransportConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn round_robin_distributes_evenly() {
        let rr = RoundRobin::new();
        for name in ["a", "b", "c"] {
            rr.add(backend(name, 1));
        }
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let picked = rr.select("1.2.3.4").unwrap();
            *counts.entry(picked.name.clone()).or_default() += 1;
        }
        for count in counts.values() {
            assert_eq!(*count, 100);
        }
    }

    #[test]
    fn least_connections_picks_minimum() {
        let lc = LeastConnections::new();
        let a = backend("a", 1);
        let b = backend("b", 1);
        let c = backend("c", 1);
        for _ in 0..5 {
            a.inc_connections();
        }
        for _ in 0..2 {
            b.inc_connections();
        }
        for _ in 0..10 {
            c.inc_connections();
        }
        lc.add(a);
        lc.add(b.clone());
        lc.add(c);

        let picked = lc.select("1.2.3.4").unwrap();
        assert_eq!(picked.name, b.name);
    }

    #[test]
    fn weighted_round_robin_matches_ratio_exactly() {
        let wrr = WeightedRoundRobin::new();
        wrr.add(backend("a", 5));
        wrr.add(backend("b", 2));
        wrr.add(backend("c", 1));

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..800 {
            let picked = wrr.select("1.2.3.4").unwrap();
            *counts.entry(picked.name.clone()).or_default() += 1;
        }
        assert_eq!(counts["a"], 500);
        assert_eq!(counts["b"], 200);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn ip_hash_is_sticky() {
        let ih = IpHash::new();
        for name in ["a", "b", "c"] {
            ih.add(backend(name, 1));
        }
        let first = ih.select("192.168.1.100").unwrap().name.clone();
        for _ in 0..10 {
            assert_eq!(ih.select("192.168.1.100").unwrap().name, first);
        }
    }

    #[test]
    fn empty_strategy_returns_none() {
        let rr = RoundRobin::new();
        assert!(rr.select("1.2.3.4").is_none());
    }
}
