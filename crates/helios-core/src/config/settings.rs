//! The YAML config schema and its loader.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HeliosError;
use crate::models::backend::BackendConfig;

const MAX_CONFIG_FILE_BYTES: u64 = 10 * 1024 * 1024;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_read_timeout")]
    pub read: u64,
    #[serde(default = "default_write_timeout")]
    pub write: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
    #[serde(default)]
    pub handler: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown: u64,
    #[serde(default = "default_backend_dial_timeout")]
    pub backend_dial: u64,
    #[serde(default = "default_backend_read_timeout")]
    pub backend_read: u64,
    #[serde(default = "default_backend_idle_timeout")]
    pub backend_idle: u64,
}

fn default_read_timeout() -> u64 {
    15
}
fn default_write_timeout() -> u64 {
    15
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_backend_dial_timeout() -> u64 {
    10
}
fn default_backend_read_timeout() -> u64 {
    30
}
fn default_backend_idle_timeout() -> u64 {
    90
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            read: default_read_timeout(),
            write: default_write_timeout(),
            idle: default_idle_timeout(),
            handler: 0,
            shutdown: default_shutdown_timeout(),
            backend_dial: default_backend_dial_timeout(),
            backend_read: default_backend_read_timeout(),
            backend_idle: default_backend_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketPoolSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
}

fn default_max_idle() -> usize {
    16
}
fn default_max_active() -> usize {
    64
}
fn default_idle_timeout_seconds() -> u64 {
    90
}

impl Default for WebSocketPoolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub websocket_pool: WebSocketPoolSettings,
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            websocket_pool: WebSocketPoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActiveHealthCheckSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_active_interval")]
    pub interval: u64,
    #[serde(default = "default_active_timeout")]
    pub timeout: u64,
    #[serde(default = "default_active_path")]
    pub path: String,
}

fn default_active_interval() -> u64 {
    10
}
fn default_active_timeout() -> u64 {
    2
}
fn default_active_path() -> String {
    "/health".to_string()
}

impl Default for ActiveHealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_active_interval(),
            timeout: default_active_timeout(),
            path: default_active_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PassiveHealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_unhealthy_timeout")]
    pub unhealthy_timeout: u64,
}

fn default_unhealthy_threshold() -> u32 {
    5
}
fn default_unhealthy_timeout() -> u64 {
    30
}

impl Default for PassiveHealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            unhealthy_threshold: default_unhealthy_threshold(),
            unhealthy_timeout: default_unhealthy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthChecksConfig {
    #[serde(default)]
    pub active: ActiveHealthCheckSettings,
    #[serde(default)]
    pub passive: PassiveHealthCheckSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_refill_rate_seconds")]
    pub refill_rate_seconds: f64,
}

fn default_max_tokens() -> u64 {
    100
}
fn default_refill_rate_seconds() -> f64 {
    0.1
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: default_max_tokens(),
            refill_rate_seconds: default_refill_rate_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
}

fn default_max_requests() -> u64 {
    1
}
fn default_interval_seconds() -> u64 {
    60
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_failure_threshold() -> u64 {
    5
}
fn default_success_threshold() -> u64 {
    2
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_max_requests(),
            interval_seconds: default_interval_seconds(),
            timeout_seconds: default_timeout_seconds(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_port() -> u16 {
    9090
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
    #[serde(default)]
    pub ip_deny_list: Vec<String>,
}

fn default_admin_port() -> u16 {
    9091
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub chain: Vec<PluginEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestIdSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_request_id_header")]
    pub header: String,
}

fn default_request_id_header() -> String {
    "X-Request-Id".to_string()
}

impl Default for RequestIdSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            header: default_request_id_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trace_header")]
    pub header: String,
}

fn default_trace_header() -> String {
    "X-Trace-Id".to_string()
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            header: default_trace_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub include_caller: bool,
    #[serde(default)]
    pub request_id: RequestIdSettings,
    #[serde(default)]
    pub trace: TraceSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "console".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_caller: false,
            request_id: RequestIdSettings::default(),
            trace: TraceSettings::default(),
        }
    }
}

/// Top-level Helios config file (`helios.yaml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub health_checks: HealthChecksConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub admin_api: AdminApiConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TimeoutsConfig {
    pub fn backend_dial(&self) -> Duration {
        Duration::from_secs(self.backend_dial)
    }
    pub fn backend_read(&self) -> Duration {
        Duration::from_secs(self.backend_read)
    }
    pub fn backend_idle(&self) -> Duration {
        Duration::from_secs(self.backend_idle)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown)
    }
    /// Front-door read deadline: how long the server waits to receive a
    /// full request from the client.
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read)
    }
    /// Front-door write/disconnect deadline.
    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write)
    }
    /// Keep-alive idle window between requests on the same connection.
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle)
    }
    /// Deadline for the whole handler pipeline, independent of the
    /// backend-specific dial/read/idle timeouts.
    pub fn handler(&self) -> Duration {
        Duration::from_secs(self.handler)
    }
}

/// Loads and parses the YAML config file at `path`. Refuses to read a path
/// that escapes the current working directory (unless absolute) and caps
/// the file at 10MB, mirroring the JSON loader this was adapted from.
pub fn load_config(path: &str) -> Result<Config, HeliosError> {
    let requested = Path::new(path);
    let canonical = if requested.is_absolute() {
        requested
            .canonicalize()
            .map_err(|e| HeliosError::Config(format!("config file '{path}' not found: {e}")))?
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| HeliosError::Config(format!("cannot resolve current directory: {e}")))?;
        let joined = cwd.join(requested);
        joined
            .canonicalize()
            .map_err(|e| HeliosError::Config(format!("config file '{path}' not found: {e}")))?
    };

    let metadata = fs::metadata(&canonical)
        .map_err(|e| HeliosError::Config(format!("cannot stat config file: {e}")))?;
    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        return Err(HeliosError::Config(format!(
            "config file exceeds {MAX_CONFIG_FILE_BYTES} byte limit"
        )));
    }

    let contents = fs::read_to_string(&canonical)
        .map_err(|e| HeliosError::Config(format!("cannot read config file: {e}")))?;

    serde_yaml::from_str(&contents)
        .map_err(|e| HeliosError::Config(format!("invalid YAML in config file: {e}")))
}
