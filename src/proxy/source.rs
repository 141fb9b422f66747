use crate::models::ProxySource;
use crate::proxy::ring::ProxyRing;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct PublicProxyList {
    #[serde(default)]
    http: Vec<String>,
}

/// Adds the `http://` scheme to bare `host:port` entries.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Some(trimmed.to_string())
    } else {
        Some(format!("http://{}", trimmed))
    }
}

fn normalize_all(raw: Vec<String>) -> Vec<String> {
    raw.iter().filter_map(|s| normalize_address(s)).collect()
}

fn resolve_path(path: &str, data_dir: &Path) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        data_dir.join(candidate)
    }
}

pub async fn fetch_addresses(
    source: &ProxySource,
    data_dir: &Path,
    client: &reqwest::Client,
) -> Result<Vec<String>, String> {
    match source {
        ProxySource::Inline { addresses } => Ok(normalize_all(addresses.clone())),
        ProxySource::Static { path } => {
            let path = resolve_path(path, data_dir);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("failed_to_read_proxy_file {}: {}", path.display(), e))?;
            let raw: Vec<String> = serde_json::from_str(&content)
                .map_err(|e| format!("failed_to_parse_proxy_file {}: {}", path.display(), e))?;
            Ok(normalize_all(raw))
        }
        ProxySource::Remote { url } => {
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| format!("failed_to_fetch_proxy_list: {}", e))?;
            if !response.status().is_success() {
                return Err(format!(
                    "failed_to_fetch_proxy_list: status {}",
                    response.status()
                ));
            }
            let text = response
                .text()
                .await
                .map_err(|e| format!("failed_to_read_proxy_list: {}", e))?;
            let list: PublicProxyList = serde_json::from_str(&text)
                .map_err(|e| format!("failed_to_parse_proxy_list: {}", e))?;
            Ok(normalize_all(list.http))
        }
    }
}

/// Loads the configured source into the ring.
pub async fn load_ring(
    ring: &ProxyRing,
    source: &ProxySource,
    data_dir: &Path,
    client: &reqwest::Client,
) -> Result<usize, String> {
    let addresses = fetch_addresses(source, data_dir, client).await?;
    let size = ring.replace(addresses);
    tracing::info!("[ProxyRing] Loaded {} proxies", size);
    Ok(size)
}

/// Retry delay while the ring has no live entry, capped by the interval.
const EMPTY_RING_RETRY: Duration = Duration::from_secs(30);

fn next_delay(ring: &ProxyRing, interval: Duration, first: bool) -> Duration {
    if ring.live_count() > 0 {
        interval
    } else if first {
        Duration::ZERO
    } else {
        interval.min(EMPTY_RING_RETRY)
    }
}

/// Reloads the ring every `interval` until cancelled. A failed reload keeps
/// the previous topology. While the ring has no live entry the first reload
/// runs at once and later ones every [`EMPTY_RING_RETRY`] at most.
pub fn start_reload_loop(
    ring: Arc<ProxyRing>,
    source: ProxySource,
    data_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "Proxy ring reload loop started (interval: {}s)",
            interval.as_secs()
        );
        let client = crate::utils::http::get_client();
        let mut first = true;
        loop {
            let delay = next_delay(&ring, interval, first);
            first = false;
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Proxy ring reload loop received cancel signal");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = load_ring(&ring, &source, &data_dir, &client).await {
                tracing::warn!("[ProxyRing] Reload failed, keeping previous ring: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use tokio::net::TcpListener;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mimbus-proxy-source-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn normalize_adds_scheme_only_when_missing() {
        assert_eq!(
            normalize_address("1.2.3.4:8080"),
            Some("http://1.2.3.4:8080".to_string())
        );
        assert_eq!(
            normalize_address("socks5://1.2.3.4:1080"),
            Some("socks5://1.2.3.4:1080".to_string())
        );
        assert_eq!(normalize_address("   "), None);
    }

    #[tokio::test]
    async fn static_file_source_loads_relative_to_data_dir() {
        let dir = temp_dir();
        std::fs::write(
            dir.join("endpoints.json"),
            r#"["10.0.0.1:3128", "10.0.0.2:3128", ""]"#,
        )
        .unwrap();

        let ring = ProxyRing::new();
        let client = reqwest::Client::new();
        let size = load_ring(&ring, &ProxySource::default(), &dir, &client)
            .await
            .unwrap();
        assert_eq!(size, 2);
        assert!(ring.resolve(1).unwrap().starts_with("http://10.0.0."));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_ring() {
        let dir = temp_dir();
        let ring = ProxyRing::from_addresses(vec!["http://10.0.0.9:3128".to_string()]);
        let client = reqwest::Client::new();
        let source = ProxySource::Static {
            path: "missing.json".to_string(),
        };

        let err = load_ring(&ring, &source, &dir, &client).await.unwrap_err();
        assert!(err.starts_with("failed_to_read_proxy_file"));
        assert_eq!(ring.resolve(3).unwrap(), "http://10.0.0.9:3128");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn remote_source_reads_http_list() {
        let app = Router::new().route(
            "/proxies.json",
            get(|| async {
                Json(serde_json::json!({
                    "http": ["10.1.0.1:80", "10.1.0.2:80"],
                    "socks5": ["10.2.0.1:1080"]
                }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let source = ProxySource::Remote {
            url: format!("http://{}/proxies.json", addr),
        };
        let addresses = fetch_addresses(&source, Path::new("."), &reqwest::Client::new())
            .await
            .unwrap();
        server.abort();

        assert_eq!(
            addresses,
            vec!["http://10.1.0.1:80".to_string(), "http://10.1.0.2:80".to_string()]
        );
    }

    #[tokio::test]
    async fn reload_loop_stops_on_cancel() {
        let ring = Arc::new(ProxyRing::new());
        let cancel = CancellationToken::new();
        let handle = start_reload_loop(
            ring.clone(),
            ProxySource::Inline {
                addresses: vec!["10.0.0.1:1".to_string()],
            },
            std::env::temp_dir(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits after cancel")
            .expect("loop task");
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn empty_ring_reloads_without_waiting_an_interval() {
        let ring = Arc::new(ProxyRing::new());
        let cancel = CancellationToken::new();
        let handle = start_reload_loop(
            ring.clone(),
            ProxySource::Inline {
                addresses: vec!["10.0.0.1:1".to_string()],
            },
            std::env::temp_dir(),
            Duration::from_secs(3600),
            cancel.clone(),
        );
        let loaded = tokio::time::timeout(Duration::from_secs(2), async {
            while ring.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        cancel.cancel();
        let _ = handle.await;
        assert!(loaded.is_ok(), "ring was not reloaded before the interval");
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn empty_ring_retry_is_capped_by_interval() {
        let empty = ProxyRing::new();
        let hour = Duration::from_secs(3600);
        assert_eq!(next_delay(&empty, hour, true), Duration::ZERO);
        assert_eq!(next_delay(&empty, hour, false), EMPTY_RING_RETRY);
        assert_eq!(
            next_delay(&empty, Duration::from_secs(5), false),
            Duration::from_secs(5)
        );

        let ring = ProxyRing::from_addresses(["http://10.0.0.1:1".to_string()]);
        assert_eq!(next_delay(&ring, hour, true), hour);
    }
}
