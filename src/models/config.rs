use crate::constants;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub proxy: ProxyRingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_data_version")]
    pub data_version: u32,
    #[serde(default = "default_unity_version")]
    pub unity_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_base_url() -> String {
    constants::DEFAULT_BASE_URL.to_string()
}

fn default_client_version() -> String {
    constants::CLIENT_VERSION.to_string()
}

fn default_data_version() -> u32 {
    constants::DATA_VERSION
}

fn default_unity_version() -> String {
    constants::UNITY_VERSION.to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> usize {
    6
}

impl UpstreamConfig {
    pub fn effective_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| constants::unity_user_agent(&self.unity_version))
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_version: default_client_version(),
            data_version: default_data_version(),
            unity_version: default_unity_version(),
            user_agent: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_broker_socket")]
    pub broker_socket: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,
}

fn default_broker_socket() -> String {
    constants::DEFAULT_BROKER_SOCKET.to_string()
}

fn default_token_ttl_secs() -> i64 {
    60 * 60
}

fn default_challenge_ttl_secs() -> u64 {
    10 * 60
}

impl AuthConfig {
    pub fn broker_socket_path(&self) -> PathBuf {
        PathBuf::from(&self.broker_socket)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            broker_socket: default_broker_socket(),
            token_ttl_secs: default_token_ttl_secs(),
            challenge_ttl_secs: default_challenge_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Minimum time between two automated runs of the same account.
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: i64,
    /// How long before a due run the reminder goes out.
    #[serde(default = "default_notify_lead_secs")]
    pub notify_lead_secs: i64,
    /// Stamina spent per assembled module.
    #[serde(default = "default_module_cost")]
    pub module_cost: u32,
}

fn default_true() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    60
}

fn default_run_interval_secs() -> i64 {
    8 * 60 * 60
}

fn default_notify_lead_secs() -> i64 {
    15 * 60
}

fn default_module_cost() -> u32 {
    20
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            run_interval_secs: default_run_interval_secs(),
            notify_lead_secs: default_notify_lead_secs(),
            module_cost: default_module_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxySource {
    /// JSON array of `host:port` strings in a file (relative paths resolve
    /// against the data directory).
    Static { path: String },
    /// Addresses listed directly in the config.
    Inline { addresses: Vec<String> },
    /// Public list served as JSON `{"http": ["host:port", ...]}`.
    Remote { url: String },
}

impl Default for ProxySource {
    fn default() -> Self {
        ProxySource::Static {
            path: constants::STATIC_PROXY_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRingConfig {
    /// When disabled every upstream call goes out directly.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub source: ProxySource,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

fn default_reload_interval_secs() -> u64 {
    60 * 60
}

impl Default for ProxyRingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: ProxySource::default(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            scheduler: SchedulerConfig::default(),
            proxy: ProxyRingConfig::default(),
            database_path: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
