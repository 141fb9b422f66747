use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::models::{AppConfig, ProxySource};

const CONFIG_FILE: &str = "config.json";
const DATA_DIR: &str = ".mimbus";

pub fn get_data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }
    if let Ok(env_path) = std::env::var("DATA_DIR") {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            ensure_dir(&data_dir)?;
            return Ok(data_dir);
        }
    }
    if cfg!(test) {
        let data_dir = std::env::temp_dir().join(format!(".mimbus-test-{}", std::process::id()));
        ensure_dir(&data_dir)?;
        return Ok(data_dir);
    }

    if let Some(home) = dirs::home_dir() {
        let data_dir = home.join(DATA_DIR);
        if ensure_dir(&data_dir).is_ok() {
            return Ok(data_dir);
        }
    }
    let fallback_dir = std::env::temp_dir().join(DATA_DIR);
    ensure_dir(&fallback_dir)?;
    Ok(fallback_dir)
}

/// Reads `<data_dir>/config.json`, writing the defaults on first run.
pub fn load_app_config(data_dir: &Path) -> Result<AppConfig, String> {
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        if let Err(e) = save_app_config(data_dir, &config) {
            tracing::warn!("Failed to write default config: {}", e);
        }
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(data_dir: &Path, config: &AppConfig) -> Result<(), String> {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;

    fs::write(&config_path, content).map_err(|e| format!("failed_to_save_config: {}", e))
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Applies environment-style overrides read through `lookup`. Values that
/// do not parse are logged and ignored.
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = get("DATABASE_PATH") {
        config.database_path = Some(path);
    }
    if let Some(socket) = get("BROKER_SOCKET") {
        config.auth.broker_socket = socket;
    }
    if let Some(raw) = get("AUTH_TOKEN_TTL") {
        match raw.trim().parse::<i64>() {
            Ok(ttl) => config.auth.token_ttl_secs = ttl,
            Err(_) => tracing::warn!("Ignoring invalid AUTH_TOKEN_TTL value: {}", raw),
        }
    }
    if let Some(raw) = get("USE_PRIVATE_PROXY") {
        match parse_bool(&raw) {
            Some(true) => {
                if !matches!(config.proxy.source, ProxySource::Static { .. }) {
                    config.proxy.source = ProxySource::default();
                }
            }
            Some(false) => {
                config.proxy.source = ProxySource::Remote {
                    url: constants::PUBLIC_PROXY_LIST_URL.to_string(),
                }
            }
            None => tracing::warn!("Ignoring invalid USE_PRIVATE_PROXY value: {}", raw),
        }
    }
    if let Some(url) = get("PROXY_LIST_URL") {
        config.proxy.source = ProxySource::Remote { url };
    }
    if let Some(url) = get("UPSTREAM_BASE_URL") {
        config.upstream.base_url = url;
    }
}

pub fn resolve_database_path(config: &AppConfig, data_dir: &Path) -> PathBuf {
    match config.database_path.as_deref() {
        Some(path) if !path.trim().is_empty() => {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                data_dir.join(path)
            }
        }
        _ => crate::modules::persistence::account_db::get_db_path(data_dir),
    }
}
