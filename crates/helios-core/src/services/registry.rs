//! The Backend Registry: the runtime-mutable source of truth for the
//! backend pool, and the only place `add`/`remove`/`set_strategy` mutations
//! are serialized.

use std::sync::{Arc, Mutex, RwLock};

use crate::error::HeliosError;
use crate::models::backend::{Backend, BackendConfig, BackendInfo, TransportConfig};
use crate::services::strategy::{self, Strategy};

/// Owns every admitted [`Backend`] and the currently active [`Strategy`].
/// `mutation` serializes `add`/`remove`/`set_strategy` against each other;
/// the fast read path (`list`, and the dispatcher's `select`) never takes it.
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<Backend>>>,
    strategy: RwLock<Arc<dyn Strategy>>,
    mutation: Mutex<()>,
    transport: TransportConfig,
}

impl BackendRegistry {
    pub fn new(initial_strategy: &str, transport: TransportConfig) -> Result<Self, HeliosError> {
        let strategy = strategy::build(initial_strategy)?;
        Ok(Self {
            backends: RwLock::new(Vec::new()),
            strategy: RwLock::new(Arc::from(strategy)),
            mutation: Mutex::new(()),
            transport,
        })
    }

    /// Parses and admits a new backend. Fails with `HeliosError::Config` if
    /// `cfg.address` isn't a valid URL.
    pub fn add(&self, cfg: &BackendConfig) -> Result<(), HeliosError> {
        let backend = Arc::new(Backend::new(cfg, self.transport)?);
        let _guard = self.mutation.lock().expect("registry mutation lock poisoned");
        self.backends.write().expect("registry backends lock poisoned").push(backend.clone());
        self.strategy.read().expect("registry strategy lock poisoned").add(backend);
        Ok(())
    }

    /// Removes the first record with a matching name. Idempotent.
    pub fn remove(&self, name: &str) {
        let _guard = self.mutation.lock().expect("registry mutation lock poisoned");
        self.backends
            .write()
            .expect("registry backends lock poisoned")
            .retain(|b| b.name != name);
        self.strategy.read().expect("registry strategy lock poisoned").remove(name);
    }

    /// Snapshot of every backend currently admitted.
    pub fn list(&self) -> Vec<BackendInfo> {
        self.backends
            .read()
            .expect("registry backends lock poisoned")
            .iter()
            .map(|b| b.info())
            .collect()
    }

    /// Builds a new strategy, seeds it from the current backend set, then
    /// swaps it in atomically under `mutation`. In-flight requests that
    /// already hold the old `Arc<dyn Strategy>` finish against it; new
    /// selections observe the swap.
    pub fn set_strategy(&self, name: &str) -> Result<(), HeliosError> {
        let new_strategy = strategy::build(name)?;
        let _guard = self.mutation.lock().expect("registry mutation lock poisoned");
        let current = self.backends.read().expect("registry backends lock poisoned").clone();
        new_strategy.seed(current);
        *self.strategy.write().expect("registry strategy lock poisoned") = Arc::from(new_strategy);
        Ok(())
    }

    /// Returns the currently active strategy handle for the dispatcher to
    /// select against. Cloning the `Arc` is cheap and lets the in-flight
    /// request keep working against a consistent strategy even if an admin
    /// mutation swaps it mid-flight.
    pub fn current_strategy(&self) -> Arc<dyn Strategy> {
        self.strategy.read().expect("registry strategy lock poisoned").clone()
    }

    /// Looks up a live backend handle by name — used by the health
    /// supervisor's active probes.
    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends
            .read()
            .expect("registry backends lock poisoned")
            .iter()
            .find(|b| b.name == name)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.read().expect("registry backends lock poisoned").clone()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.read().expect("registry strategy lock poisoned").strategy_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            address: "http://127.0.0.1:9000".to_string(),
            weight: None,
        }
    }

    #[test]
    fn add_then_list_roundtrips() {
        let reg = BackendRegistry::new("round_robin", TransportConfig::default()).unwrap();
        reg.add(&cfg("a")).unwrap();
        reg.add(&cfg("b")).unwrap();
        let names: Vec<_> = reg.list().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = BackendRegistry::new("round_robin", TransportConfig::default()).unwrap();
        reg.add(&cfg("a")).unwrap();
        reg.remove("a");
        reg.remove("a");
        assert!(reg.list().is_empty());
    }

    #[test]
    fn invalid_address_is_rejected() {
        let reg = BackendRegistry::new("round_robin", TransportConfig::default()).unwrap();
        let bad = BackendConfig {
            name: "a".into(),
            address: "bad url".into(),
            weight: None,
        };
        assert!(reg.add(&bad).is_err());
    }

    #[test]
    fn set_strategy_preserves_backend_set() {
        let reg = BackendRegistry::new("round_robin", TransportConfig::default()).unwrap();
        reg.add(&cfg("a")).unwrap();
        reg.add(&cfg("b")).unwrap();
        let before = reg.list();
        reg.set_strategy("least_connections").unwrap();
        let after = reg.list();
        assert_eq!(before.len(), after.len());
        assert_eq!(reg.strategy_name(), "least_connections");
    }

    #[test]
    fn unknown_strategy_fails() {
        let reg = BackendRegistry::new("round_robin", TransportConfig::default()).unwrap();
        assert!(reg.set_strategy("nonexistent").is_err());
    }
}
