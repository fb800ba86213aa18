//! Exhaustive config validation. Runs before any component is constructed
//! and surfaces the first offending field with a human-readable message;
//! warnings and recommendations are non-fatal and only collected once the
//! config is otherwise valid.

use crate::config::settings::Config;
use crate::error::HeliosError;

const KNOWN_STRATEGIES: &[&str] = &[
    "round_robin",
    "least_connections",
    "weighted_round_robin",
    "ip_hash",
    "ip_hash_consistent",
];

const KNOWN_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "fatal"];
const KNOWN_LOG_FORMATS: &[&str] = &["json", "console"];

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            is_valid: true,
            warnings: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn add_recommendation(&mut self, msg: impl Into<String>) {
        self.recommendations.push(msg.into());
    }
}

fn fatal(field: &str, msg: impl std::fmt::Display) -> HeliosError {
    HeliosError::Config(format!("{field}: {msg}"))
}

/// Validates `cfg`, returning the first fatal error it finds. A config that
/// passes every fatal check still returns warnings/recommendations for
/// operator-facing diagnostics.
pub fn validate(cfg: &Config) -> Result<ValidationResult, HeliosError> {
    if cfg.server.port == 0 {
        return Err(fatal("server.port", "must be between 1 and 65535"));
    }

    if cfg.server.tls.enabled {
        if cfg.server.tls.cert_file.as_deref().unwrap_or("").is_empty() {
            return Err(fatal("server.tls.cert_file", "required when tls.enabled is true"));
        }
        if cfg.server.tls.key_file.as_deref().unwrap_or("").is_empty() {
            return Err(fatal("server.tls.key_file", "required when tls.enabled is true"));
        }
    }

    if cfg.backends.is_empty() {
        return Err(fatal("backends", "at least one backend must be configured"));
    }

    for (idx, backend) in cfg.backends.iter().enumerate() {
        if backend.name.trim().is_empty() {
            return Err(fatal(&format!("backends[{idx}].name"), "must not be empty"));
        }
        if backend.address.trim().is_empty() {
            return Err(fatal(&format!("backends[{idx}].address"), "must not be empty"));
        }
        if url::Url::parse(&backend.address).is_err() {
            return Err(fatal(
                &format!("backends[{idx}].address"),
                format!("'{}' is not a valid URL", backend.address),
            ));
        }
        if let Some(weight) = backend.weight {
            if weight == 0 {
                // Clamped to 1 at runtime per spec, but an explicit 0 is
                // worth calling out rather than silently overriding.
            }
            let _ = weight;
        }
    }

    if !KNOWN_STRATEGIES.contains(&cfg.load_balancer.strategy.as_str()) {
        return Err(fatal(
            "load_balancer.strategy",
            format!(
                "'{}' is not one of {:?}",
                cfg.load_balancer.strategy, KNOWN_STRATEGIES
            ),
        ));
    }

    let pool = &cfg.load_balancer.websocket_pool;
    if pool.max_idle > 0 && pool.max_active > 0 && pool.max_idle > pool.max_active {
        return Err(fatal(
            "load_balancer.websocket_pool.max_idle",
            "must be <= max_active when both are positive",
        ));
    }

    if cfg.health_checks.active.enabled {
        if cfg.health_checks.active.timeout >= cfg.health_checks.active.interval {
            return Err(fatal(
                "health_checks.active.timeout",
                "must be less than health_checks.active.interval",
            ));
        }
        if cfg.health_checks.active.path.trim().is_empty() {
            return Err(fatal(
                "health_checks.active.path",
                "must not be empty when active health checks are enabled",
            ));
        }
    }

    if cfg.health_checks.passive.enabled {
        if cfg.health_checks.passive.unhealthy_threshold == 0 {
            return Err(fatal(
                "health_checks.passive.unhealthy_threshold",
                "must be positive",
            ));
        }
        if cfg.health_checks.passive.unhealthy_timeout == 0 {
            return Err(fatal(
                "health_checks.passive.unhealthy_timeout",
                "must be positive",
            ));
        }
    }

    if cfg.rate_limit.enabled && cfg.rate_limit.max_tokens == 0 {
        return Err(fatal("rate_limit.max_tokens", "must be positive when rate_limit.enabled is true"));
    }

    if cfg.circuit_breaker.enabled {
        if cfg.circuit_breaker.failure_threshold == 0 {
            return Err(fatal("circuit_breaker.failure_threshold", "must be positive"));
        }
        if cfg.circuit_breaker.success_threshold == 0 {
            return Err(fatal("circuit_breaker.success_threshold", "must be positive"));
        }
        if cfg.circuit_breaker.max_requests == 0 {
            return Err(fatal("circuit_breaker.max_requests", "must be positive"));
        }
    }

    if cfg.admin_api.enabled {
        for cidr in cfg.admin_api.ip_allow_list.iter().chain(cfg.admin_api.ip_deny_list.iter()) {
            if cidr.parse::<ipnet::IpNet>().is_err() && std::net::IpAddr::from_str(cidr).is_err() {
                return Err(fatal(
                    "admin_api.ip_allow_list/ip_deny_list",
                    format!("'{cidr}' is not a valid CIDR or IP address"),
                ));
            }
        }
    }

    if !KNOWN_LOG_LEVELS.contains(&cfg.logging.level.as_str()) {
        return Err(fatal(
            "logging.level",
            format!("'{}' is not one of {:?}", cfg.logging.level, KNOWN_LOG_LEVELS),
        ));
    }

    if !KNOWN_LOG_FORMATS.contains(&cfg.logging.format.as_str()) {
        return Err(fatal(
            "logging.format",
            format!("'{}' is not one of {:?}", cfg.logging.format, KNOWN_LOG_FORMATS),
        ));
    }

    let mut result = ValidationResult::new();

    if cfg.admin_api.enabled && cfg.admin_api.auth_token.as_deref().unwrap_or("").is_empty() {
        result.add_warning("admin_api is enabled with no auth_token — mutating endpoints are unauthenticated");
    }

    if !cfg.health_checks.active.enabled && !cfg.health_checks.passive.enabled {
        result.add_recommendation(
            "no health checking is enabled; unhealthy backends will never be detected",
        );
    }

    if !cfg.circuit_breaker.enabled {
        result.add_recommendation("circuit_breaker is disabled; upstream failures won't be short-circuited");
    }

    if cfg.backends.len() == 1 {
        result.add_recommendation("only one backend configured; load balancing strategy has no effect");
    }

    Ok(result)
}

use std::str::FromStr;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::*;
    use crate::models::backend::BackendConfig;

    fn minimal_config() -> Config {
        Config {
            server: ServerConfig {
                port: 8080,
                tls: TlsConfig::default(),
                timeouts: TimeoutsConfig::default(),
            },
            backends: vec![BackendConfig {
                name: "a".into(),
                address: "http://127.0.0.1:9000".into(),
                weight: None,
            }],
            load_balancer: LoadBalancerConfig::default(),
            health_checks: HealthChecksConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            metrics: MetricsConfig::default(),
            admin_api: AdminApiConfig::default(),
            plugins: PluginsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn minimal_config_is_valid() {
        assert!(validate(&minimal_config()).is_ok());
    }

    #[test]
    fn zero_port_is_fatal() {
        let mut cfg = minimal_config();
        cfg.server.port = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn empty_backends_is_fatal() {
        let mut cfg = minimal_config();
        cfg.backends.clear();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn invalid_backend_url_is_fatal() {
        let mut cfg = minimal_config();
        cfg.backends[0].address = "not a url".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_strategy_is_fatal() {
        let mut cfg = minimal_config();
        cfg.load_balancer.strategy = "random".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn active_timeout_must_be_less_than_interval() {
        let mut cfg = minimal_config();
        cfg.health_checks.active.enabled = true;
        cfg.health_checks.active.interval = 5;
        cfg.health_checks.active.timeout = 5;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn no_health_checks_is_only_a_recommendation() {
        let mut cfg = minimal_config();
        cfg.health_checks.active.enabled = false;
        cfg.health_checks.passive.enabled = false;
        let result = validate(&cfg).unwrap();
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn admin_api_without_token_warns_not_fails() {
        let mut cfg = minimal_config();
        cfg.admin_api.enabled = true;
        let result = validate(&cfg).unwrap();
        assert!(!result.warnings.is_empty());
    }
}
