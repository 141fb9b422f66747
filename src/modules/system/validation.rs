use crate::models::{
    AppConfig, AuthConfig, ProxyRingConfig, ProxySource, SchedulerConfig, UpstreamConfig,
};
use std::fmt;

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
    pub actual_value: Option<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual_value {
            Some(val) => write!(f, "  • {}: {} (got: {})", self.field, self.message, val),
            None => write!(f, "  • {}: {}", self.field, self.message),
        }
    }
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            actual_value: None,
        }
    }

    fn with_value(
        field: impl Into<String>,
        message: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            actual_value: Some(value.to_string()),
        }
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    validate_upstream_config(&config.upstream, &mut errors);
    validate_auth_config(&config.auth, &mut errors);
    validate_scheduler_config(&config.scheduler, &mut errors);
    validate_proxy_config(&config.proxy, &mut errors);
    if let Some(path) = &config.database_path {
        if path.trim().is_empty() {
            errors.push(ConfigError::new("database_path", "must not be blank when set"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn format_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn validate_http_url(field: &str, raw: &str, errors: &mut Vec<ConfigError>) {
    match url::Url::parse(raw.trim()) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {
            if parsed.host_str().is_none() {
                errors.push(ConfigError::with_value(field, "must include a host", raw));
            }
        }
        Ok(_) => errors.push(ConfigError::with_value(
            field,
            "must use http or https scheme",
            raw,
        )),
        Err(_) => errors.push(ConfigError::with_value(
            field,
            "must be a valid absolute URL",
            raw,
        )),
    }
}

fn validate_upstream_config(config: &UpstreamConfig, errors: &mut Vec<ConfigError>) {
    validate_http_url("upstream.base_url", &config.base_url, errors);
    if config.client_version.trim().is_empty() {
        errors.push(ConfigError::new("upstream.client_version", "must not be empty"));
    }
    if config.unity_version.trim().is_empty() {
        errors.push(ConfigError::new("upstream.unity_version", "must not be empty"));
    }
    if config.request_timeout_secs == 0 {
        errors.push(ConfigError::with_value(
            "upstream.request_timeout_secs",
            "must be greater than 0",
            config.request_timeout_secs,
        ));
    } else if config.request_timeout_secs > 300 {
        errors.push(ConfigError::with_value(
            "upstream.request_timeout_secs",
            "should not exceed 300 seconds",
            config.request_timeout_secs,
        ));
    }
    if config.max_attempts == 0 || config.max_attempts > 20 {
        errors.push(ConfigError::with_value(
            "upstream.max_attempts",
            "must be between 1 and 20",
            config.max_attempts,
        ));
    }
}

fn validate_auth_config(config: &AuthConfig, errors: &mut Vec<ConfigError>) {
    if config.broker_socket.trim().is_empty() {
        errors.push(ConfigError::new("auth.broker_socket", "must not be empty"));
    }
    if config.token_ttl_secs <= 0 {
        errors.push(ConfigError::with_value(
            "auth.token_ttl_secs",
            "must be greater than 0",
            config.token_ttl_secs,
        ));
    }
    if config.challenge_ttl_secs == 0 {
        errors.push(ConfigError::with_value(
            "auth.challenge_ttl_secs",
            "must be greater than 0",
            config.challenge_ttl_secs,
        ));
    }
}

fn validate_scheduler_config(config: &SchedulerConfig, errors: &mut Vec<ConfigError>) {
    if config.tick_secs == 0 {
        errors.push(ConfigError::with_value(
            "scheduler.tick_secs",
            "must be greater than 0",
            config.tick_secs,
        ));
    }
    if config.run_interval_secs <= 0 {
        errors.push(ConfigError::with_value(
            "scheduler.run_interval_secs",
            "must be greater than 0",
            config.run_interval_secs,
        ));
    }
    if config.notify_lead_secs <= 0 || config.notify_lead_secs >= config.run_interval_secs {
        errors.push(ConfigError::with_value(
            "scheduler.notify_lead_secs",
            "must be greater than 0 and shorter than run_interval_secs",
            config.notify_lead_secs,
        ));
    }
    if config.module_cost == 0 {
        errors.push(ConfigError::with_value(
            "scheduler.module_cost",
            "must be greater than 0",
            config.module_cost,
        ));
    }
}

fn validate_proxy_config(config: &ProxyRingConfig, errors: &mut Vec<ConfigError>) {
    if !config.enabled {
        return;
    }
    if config.reload_interval_secs == 0 {
        errors.push(ConfigError::with_value(
            "proxy.reload_interval_secs",
            "must be greater than 0",
            config.reload_interval_secs,
        ));
    }
    match &config.source {
        ProxySource::Static { path } => {
            if path.trim().is_empty() {
                errors.push(ConfigError::new("proxy.source.path", "must not be empty"));
            }
        }
        ProxySource::Inline { addresses } => {
            if addresses.is_empty() {
                errors.push(ConfigError::new(
                    "proxy.source.addresses",
                    "must list at least one proxy",
                ));
            }
            for (index, address) in addresses.iter().enumerate() {
                if address.trim().is_empty() {
                    errors.push(ConfigError::new(
                        format!("proxy.source.addresses[{}]", index),
                        "must not be empty",
                    ));
                }
            }
        }
        ProxySource::Remote { url } => validate_http_url("proxy.source.url", url, errors),
    }
}
