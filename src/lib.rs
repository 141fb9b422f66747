pub mod commands;
pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
mod utils;

#[cfg(not(unix))]
compile_error!("mimbus talks to the credential broker over a Unix socket and only builds on Unix targets");

use commands::AppState;
use models::AppConfig;
use modules::auth::broker::BrokerEndpoint;
use modules::auth::challenge::{self, ChallengeRegistry};
use modules::auth::lifecycle::TokenLifecycleManager;
use modules::persistence::account_db::SqliteAccountStore;
use modules::system::lifecycle::BackgroundTasks;
use modules::system::notifier::{LogNotifier, Notifier};
use modules::system::scheduler::AutomationScheduler;
use modules::system::{config, logger, validation};
use proxy::ring::ProxyRing;
use proxy::upstream::client::UpstreamClient;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CHALLENGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn load_config(data_dir: &Path) -> Result<AppConfig, String> {
    let mut config = config::load_app_config(data_dir)
        .map_err(|e| format!("failed_to_load_config: {}", e))?;
    config::apply_env_overrides(&mut config);
    validation::validate_app_config(&config).map_err(|errors| {
        format!(
            "configuration_validation_failed:\n{}",
            validation::format_errors(&errors)
        )
    })?;
    Ok(config)
}

/// Wires every service and spawns the background loops. The returned state
/// is what a chat front-end calls into; the tasks stop on
/// [`BackgroundTasks::graceful_shutdown`].
pub async fn start_services(
    config: AppConfig,
    data_dir: &Path,
    notifier: Arc<dyn Notifier>,
) -> Result<(AppState, BackgroundTasks), String> {
    let mut tasks = BackgroundTasks::new();

    let db_path = config::resolve_database_path(&config, data_dir);
    let store = Arc::new(
        SqliteAccountStore::open(&db_path)
            .map_err(|e| format!("failed_to_open_database {}: {}", db_path.display(), e))?,
    );
    info!("Account database: {}", db_path.display());

    let ring = if config.proxy.enabled {
        let ring = Arc::new(ProxyRing::new());
        let http = utils::http::get_client();
        if let Err(e) =
            proxy::source::load_ring(&ring, &config.proxy.source, data_dir, &http).await
        {
            warn!("[ProxyRing] Initial load failed, starting with an empty ring: {}", e);
        }
        tasks.register(
            "Proxy ring reload loop",
            proxy::source::start_reload_loop(
                ring.clone(),
                config.proxy.source.clone(),
                data_dir.to_path_buf(),
                Duration::from_secs(config.proxy.reload_interval_secs),
                tasks.child_token(),
            ),
        );
        Some(ring)
    } else {
        info!("Proxy ring disabled, upstream calls go out directly");
        None
    };

    let client = Arc::new(
        UpstreamClient::new(config.upstream.clone(), ring)
            .map_err(|e| format!("failed_to_build_upstream_client: {}", e))?,
    );

    let challenges = Arc::new(ChallengeRegistry::new(Duration::from_secs(
        config.auth.challenge_ttl_secs,
    )));
    tasks.register(
        "Challenge sweeper",
        challenge::start_sweeper(
            challenges.clone(),
            CHALLENGE_SWEEP_INTERVAL,
            tasks.child_token(),
        ),
    );

    let broker = BrokerEndpoint::new(config.auth.broker_socket_path());
    info!("Credential broker: {}", broker.socket_path().display());
    let auth = Arc::new(TokenLifecycleManager::new(
        store.clone(),
        client.clone(),
        broker,
        challenges,
        config.auth.token_ttl_secs,
    ));

    if config.scheduler.enabled {
        let scheduler = Arc::new(AutomationScheduler::new(
            store.clone(),
            auth.clone(),
            client.clone(),
            notifier,
            config.scheduler.clone(),
        ));
        tasks.register("Automation scheduler", scheduler.start(tasks.child_token()));
    } else {
        info!("Automation scheduler disabled");
    }

    Ok((AppState::new(store, auth, client), tasks))
}

pub fn run() {
    let data_dir = match config::get_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve data directory: {}", e);
            std::process::exit(1);
        }
    };
    let _log_guard = logger::init_logger(&data_dir);
    info!(
        "mimbus {} starting (data dir: {}, tls: {})",
        env!("CARGO_PKG_VERSION"),
        data_dir.display(),
        utils::http::tls_backend_name()
    );

    let config = match load_config(&data_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        let (_state, tasks) = match start_services(config, &data_dir, Arc::new(LogNotifier)).await
        {
            Ok(started) => started,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };

        info!("Service is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        tasks.graceful_shutdown(SHUTDOWN_TIMEOUT).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxySource;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mimbus_run_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn invalid_config_refuses_to_start() {
        let dir = temp_dir();
        std::fs::write(
            dir.join("config.json"),
            r#"{ "scheduler": { "tick_secs": 0 }, "upstream": { "max_attempts": 0 } }"#,
        )
        .unwrap();
        let err = load_config(&dir).unwrap_err();
        assert!(err.contains("scheduler.tick_secs"));
        assert!(err.contains("upstream.max_attempts"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn services_start_and_shut_down() {
        let dir = temp_dir();
        std::fs::write(dir.join("endpoints.json"), r#"["10.0.0.1:3128", "10.0.0.2:3128"]"#).unwrap();
        let mut config = AppConfig::new();
        config.proxy.source = ProxySource::Static {
            path: "endpoints.json".to_string(),
        };

        let (state, tasks) = start_services(config, &dir, Arc::new(LogNotifier))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(state.client.ring().map(|r| r.len()), Some(2));

        let account = commands::account::ensure_account(&state, 1, "player")
            .await
            .unwrap();
        assert_eq!(account.id, 1);
        assert!(dir.join("mimbus.db").exists());

        tasks.graceful_shutdown(Duration::from_secs(2)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disabled_ring_and_scheduler_spawn_only_sweeper() {
        let dir = temp_dir();
        let mut config = AppConfig::new();
        config.proxy.enabled = false;
        config.scheduler.enabled = false;

        let (state, tasks) = start_services(config, &dir, Arc::new(LogNotifier))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(state.client.ring().is_none());
        tasks.graceful_shutdown(Duration::from_secs(2)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
