use once_cell::sync::Lazy;
use reqwest::{header, Client, Proxy};
use std::time::Duration;

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
compile_error!("one TLS backend feature must be enabled: `tls-native` or `tls-rustls`");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsBackendSelection {
    NativeTls,
    Rustls,
}

static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| {
    apply_tls_backend(Client::builder())
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
});

fn parse_tls_backend_override() -> Option<TlsBackendSelection> {
    let raw = std::env::var("TLS_BACKEND").ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "native" | "native-tls" | "default-tls" => Some(TlsBackendSelection::NativeTls),
        "rustls" => Some(TlsBackendSelection::Rustls),
        _ => None,
    }
}

fn compiled_default_tls_backend() -> TlsBackendSelection {
    if cfg!(feature = "tls-rustls") {
        TlsBackendSelection::Rustls
    } else {
        TlsBackendSelection::NativeTls
    }
}

fn selected_tls_backend() -> TlsBackendSelection {
    match parse_tls_backend_override() {
        Some(TlsBackendSelection::NativeTls) if cfg!(feature = "tls-native") => {
            TlsBackendSelection::NativeTls
        }
        Some(TlsBackendSelection::Rustls) if cfg!(feature = "tls-rustls") => {
            TlsBackendSelection::Rustls
        }
        Some(_) => {
            tracing::warn!(
                "TLS_BACKEND requested an unavailable backend for this build; falling back to compiled default"
            );
            compiled_default_tls_backend()
        }
        None => compiled_default_tls_backend(),
    }
}

pub fn apply_tls_backend(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    match selected_tls_backend() {
        TlsBackendSelection::Rustls => {
            #[cfg(feature = "tls-rustls")]
            {
                builder.use_rustls_tls()
            }
            #[cfg(not(feature = "tls-rustls"))]
            {
                builder
            }
        }
        TlsBackendSelection::NativeTls => builder,
    }
}

pub fn tls_backend_name() -> &'static str {
    match selected_tls_backend() {
        TlsBackendSelection::NativeTls => "native-tls",
        TlsBackendSelection::Rustls => "rustls",
    }
}

/// General-purpose client for proxy-list downloads and similar side calls.
pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}

/// Headers every game request carries, mimicking the Unity client.
pub fn game_headers(unity_version: &str) -> header::HeaderMap {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers.insert(header::ACCEPT, header::HeaderValue::from_static("*/*"));
    if let Ok(value) = header::HeaderValue::from_str(unity_version) {
        headers.insert("X-Unity-Version", value);
    }
    headers
}

/// Builds a client for the game API, optionally routed through `proxy_url`.
pub fn build_game_client(
    proxy_url: Option<&str>,
    timeout: Duration,
    user_agent: &str,
    unity_version: &str,
) -> Result<Client, String> {
    let mut builder = apply_tls_backend(Client::builder())
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(user_agent)
        .default_headers(game_headers(unity_version));

    match proxy_url {
        Some(url) => {
            let proxy = Proxy::all(url).map_err(|e| format!("invalid_proxy_url {}: {}", url, e))?;
            builder = builder.proxy(proxy);
        }
        None => {
            builder = builder.no_proxy();
        }
    }

    builder
        .build()
        .map_err(|e| format!("failed_to_build_http_client: {}", e))
}
