pub const DEFAULT_BASE_URL: &str = "https://www.limbuscompanyapi-2.com";
pub const CLIENT_VERSION: &str = "1.3.0";
pub const DATA_VERSION: u32 = 26;
pub const UNITY_VERSION: &str = "2021.3.0f1";
pub const DEVICE_MODEL: &str = "Desktop";

/// State value the upstream puts in every accepted response.
pub const UPSTREAM_OK_STATE: &str = "ok";

/// Routing key used for calls made before an account has an upstream uid.
pub const DEFAULT_ROUTING_KEY: i64 = 1;

pub const DEFAULT_BROKER_SOCKET: &str = "/tmp/mimbus-token.sock";
pub const PUBLIC_PROXY_LIST_URL: &str =
    "https://raw.githubusercontent.com/jetkai/proxy-list/main/online-proxies/json/proxies.json";
pub const STATIC_PROXY_FILE: &str = "endpoints.json";

pub fn unity_user_agent(unity_version: &str) -> String {
    format!(
        "UnityPlayer/{} (UnityWebRequest/1.0, libcurl/7.80.0-DEV)",
        unity_version
    )
}
