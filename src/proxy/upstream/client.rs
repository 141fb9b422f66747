// Game API client.
// Every call goes: resolve proxy -> invoke -> classify -> maybe evict -> maybe retry.

use crate::constants::{DEVICE_MODEL, UPSTREAM_OK_STATE};
use crate::error::ClientError;
use crate::models::UpstreamConfig;
use crate::proxy::ring::ProxyRing;
use crate::proxy::upstream::models::{
    BaseResponse, GameRequest, LoadAllResponse, SignInResponse, UserAuthBlock,
};
use crate::proxy::upstream::pipeline::{is_transient, run_with_retry, RetryPolicy};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const SIGN_IN: &str = "login/SignInAsSteam";
pub const LOAD_ALL: &str = "api/LoadUserDataAll";
pub const PURCHASE_MODULE: &str = "api/PurchaseEnkephalinModule";
pub const ENTER_EXP_DUNGEON: &str = "api/EnterExpDungeon";
pub const EXIT_EXP_DUNGEON: &str = "api/ExitExpDungeon";
pub const UNSEAL_MAILS: &str = "api/UnsealMails";

pub struct UpstreamClient {
    config: UpstreamConfig,
    ring: Option<Arc<ProxyRing>>,
    policy: RetryPolicy,
    default_client: Client,
    client_cache: DashMap<String, Client>, // proxy address -> Client
}

impl UpstreamClient {
    /// `ring` set to `None` sends every call directly.
    pub fn new(config: UpstreamConfig, ring: Option<Arc<ProxyRing>>) -> Result<Self, ClientError> {
        let default_client = crate::utils::http::build_game_client(
            None,
            Duration::from_secs(config.request_timeout_secs),
            &config.effective_user_agent(),
            &config.unity_version,
        )
        .map_err(ClientError::Build)?;

        Ok(Self {
            policy: RetryPolicy::new(config.max_attempts),
            config,
            ring,
            default_client,
            client_cache: DashMap::new(),
        })
    }

    pub fn ring(&self) -> Option<&Arc<ProxyRing>> {
        self.ring.as_ref()
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, ClientError> {
        let Some(address) = proxy else {
            return Ok(self.default_client.clone());
        };
        if let Some(client) = self.client_cache.get(address) {
            return Ok(client.clone());
        }
        let client = crate::utils::http::build_game_client(
            Some(address),
            Duration::from_secs(self.config.request_timeout_secs),
            &self.config.effective_user_agent(),
            &self.config.unity_version,
        )
        .map_err(ClientError::Build)?;
        self.client_cache.insert(address.to_string(), client.clone());
        Ok(client)
    }

    fn build_url(&self, action: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), action)
    }

    fn user_auth(&self, uid: i64, auth_code: &str) -> UserAuthBlock {
        UserAuthBlock {
            uid,
            dbid: 0,
            auth_code: auth_code.to_string(),
            version: self.config.client_version.clone(),
            synchronous_data_version: self.config.data_version,
        }
    }

    /// Evicts the proxy that carried a failed attempt and builds the error.
    fn transport_failure(&self, key: i64, proxy: Option<&str>, message: String) -> ClientError {
        let proxy_label = proxy.unwrap_or("direct").to_string();
        if let (Some(ring), Some(address)) = (&self.ring, proxy) {
            if ring.evict_address(address) {
                self.client_cache.remove(address);
                tracing::debug!(
                    "[Upstream] Proxy {} is not working for key {}, evicted",
                    address,
                    key
                );
            }
        }
        ClientError::Retryable {
            proxy: proxy_label,
            message,
        }
    }

    async fn attempt<R: DeserializeOwned>(
        &self,
        key: i64,
        action: &str,
        body: &Value,
        attempt: usize,
    ) -> Result<R, ClientError> {
        let proxy = match &self.ring {
            Some(ring) => Some(ring.resolve(key)?),
            None => None,
        };
        let client = self.client_for(proxy.as_deref())?;
        tracing::debug!(
            "[Upstream] {} via {} (key {}, attempt {})",
            action,
            proxy.as_deref().unwrap_or("direct"),
            key,
            attempt
        );

        let response = match client.post(self.build_url(action)).json(body).send().await {
            Ok(response) => response,
            Err(e) if is_transient(&e) => {
                return Err(self.transport_failure(key, proxy.as_deref(), e.to_string()))
            }
            Err(e) => {
                return Err(ClientError::Request {
                    action: action.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if is_transient(&e) => {
                return Err(self.transport_failure(key, proxy.as_deref(), e.to_string()))
            }
            Err(e) => {
                return Err(ClientError::Request {
                    action: action.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) if proxy.is_some() && is_proxy_failure_status(status) => {
                return Err(self.transport_failure(
                    key,
                    proxy.as_deref(),
                    format!("proxy answered {} with non-json body: {}", status, e),
                ))
            }
            Err(e) => {
                return Err(ClientError::Decode {
                    action: action.to_string(),
                    message: format!("status {}: {}", status, e),
                })
            }
        };

        check_state(action, &value)?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode {
            action: action.to_string(),
            message: e.to_string(),
        })
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        key: i64,
        action: &str,
        request: GameRequest<P>,
    ) -> Result<R, ClientError> {
        let body = serde_json::to_value(&request).map_err(|e| ClientError::Request {
            action: action.to_string(),
            message: e.to_string(),
        })?;
        run_with_retry(self.policy, action, |attempt| {
            self.attempt(key, action, &body, attempt)
        })
        .await
    }

    /// Exchanges a broker-issued Steam ticket for an upstream session.
    /// `key` routes the call, see [`crate::models::Account::routing_key`].
    pub async fn sign_in(&self, steam_token: &str, key: i64) -> Result<SignInResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(0, ""),
            parameters: json!({
                "steamToken": steam_token,
                "version": self.config.client_version,
                "deviceModel": DEVICE_MODEL,
            }),
        };
        self.call(key, SIGN_IN, request).await
    }

    pub async fn load_all(&self, uid: i64, auth_code: &str) -> Result<LoadAllResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(uid, auth_code),
            parameters: json!({}),
        };
        self.call(uid, LOAD_ALL, request).await
    }

    pub async fn purchase_module(&self, uid: i64, auth_code: &str, num: i64) -> Result<BaseResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(uid, auth_code),
            parameters: json!({ "num": num }),
        };
        self.call(uid, PURCHASE_MODULE, request).await
    }

    pub async fn enter_exp_dungeon(
        &self,
        uid: i64,
        auth_code: &str,
        dungeon_id: i64,
    ) -> Result<BaseResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(uid, auth_code),
            parameters: json!({ "dungeonid": dungeon_id }),
        };
        self.call(uid, ENTER_EXP_DUNGEON, request).await
    }

    /// Leaves the dungeon reporting a won battle.
    pub async fn exit_exp_dungeon(&self, uid: i64, auth_code: &str) -> Result<BaseResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(uid, auth_code),
            parameters: json!({
                "formationId": 0,
                "isWin": 1,
                "supportCharacterId": -1,
                "supportParticipate": false,
                "battlePassParameters": {
                    "enemyKillCount": 10,
                    "abnormalityKillCount": 0,
                    "isUsedDailyChar": true,
                    "isUsedSeasonEgo": false,
                    "isUsedSeasonAnnouncer": false
                },
            }),
        };
        self.call(uid, EXIT_EXP_DUNGEON, request).await
    }

    pub async fn unseal_mails(
        &self,
        uid: i64,
        auth_code: &str,
        mail_ids: &[i64],
    ) -> Result<BaseResponse, ClientError> {
        let request = GameRequest {
            user_auth: self.user_auth(uid, auth_code),
            parameters: json!({ "mailIds": mail_ids }),
        };
        self.call(uid, UNSEAL_MAILS, request).await
    }
}

fn is_proxy_failure_status(status: StatusCode) -> bool {
    status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

fn check_state(action: &str, value: &Value) -> Result<(), ClientError> {
    let state = value.get("state").and_then(|s| s.as_str());
    if state == Some(UPSTREAM_OK_STATE) {
        return Ok(());
    }
    Err(ClientError::UpstreamStatus {
        action: action.to_string(),
        state: state.unwrap_or("missing").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::Uri, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockState {
        hits: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<(String, Value)>>>,
        reject_with: Arc<Mutex<Option<String>>>,
    }

    async fn game_handler(
        State(state): State<MockState>,
        uri: Uri,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let path = uri.path().trim_start_matches('/').to_string();
        state.requests.lock().await.push((path.clone(), body));

        if let Some(rejection) = state.reject_with.lock().await.clone() {
            return Json(json!({ "state": rejection }));
        }
        match path.as_str() {
            SIGN_IN => Json(json!({
                "state": "ok",
                "result": { "userAuth": { "uid": 501, "auth_code": "session-501" } }
            })),
            LOAD_ALL => Json(json!({
                "state": "ok",
                "updated": { "userInfo": { "uid": 501, "level": 12, "stamina": 64 }, "mailList": [] },
                "result": { "profile": { "public_uid": "PUB-501", "level": 12 } }
            })),
            _ => Json(json!({ "state": "ok" })),
        }
    }

    // Serves both plain and absolute-form (proxied) requests.
    async fn start_mock_server() -> (String, MockState, tokio::task::JoinHandle<()>) {
        let state = MockState::default();
        let app = Router::new()
            .route("/*path", post(game_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{}", addr), state, server)
    }

    // Listeners are held together so every port is distinct, then closed.
    fn dead_addresses(n: usize) -> Vec<String> {
        let listeners: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").expect("bind"))
            .collect();
        listeners
            .iter()
            .map(|l| format!("http://{}", l.local_addr().expect("local addr")))
            .collect()
    }

    fn config(base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base_url.to_string(),
            request_timeout_secs: 5,
            ..UpstreamConfig::default()
        }
    }

    #[tokio::test]
    async fn direct_call_sends_user_auth_block() {
        let (base, state, server) = start_mock_server().await;
        let client = UpstreamClient::new(config(&base), None).unwrap();

        let data = client.load_all(501, "session-501").await.unwrap();
        server.abort();

        assert_eq!(data.updated.user_info.stamina, 64);
        let requests = state.requests.lock().await.clone();
        assert_eq!(requests.len(), 1);
        let (path, body) = &requests[0];
        assert_eq!(path, LOAD_ALL);
        assert_eq!(body.pointer("/userAuth/uid").unwrap(), 501);
        assert_eq!(body.pointer("/userAuth/authCode").unwrap(), "session-501");
        assert_eq!(body.pointer("/userAuth/version").unwrap(), "1.3.0");
    }

    #[tokio::test]
    async fn proxied_call_reaches_upstream_through_ring() {
        let (proxy, state, server) = start_mock_server().await;
        let ring = Arc::new(ProxyRing::from_addresses(vec![proxy]));
        let client = UpstreamClient::new(config("http://game.invalid"), Some(ring.clone())).unwrap();

        let response = client.sign_in("ticket", crate::constants::DEFAULT_ROUTING_KEY).await.unwrap();
        server.abort();

        assert_eq!(response.result.user_auth.uid, 501);
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
        let requests = state.requests.lock().await.clone();
        assert_eq!(
            requests[0].1.pointer("/parameters/steamToken").unwrap(),
            "ticket"
        );
        assert_eq!(ring.live_count(), 1);
    }

    #[tokio::test]
    async fn upstream_rejection_is_not_retried_and_keeps_proxy() {
        let (proxy, state, server) = start_mock_server().await;
        *state.reject_with.lock().await = Some("invalid_auth".to_string());
        let ring = Arc::new(ProxyRing::from_addresses(vec![proxy]));
        let client = UpstreamClient::new(config("http://game.invalid"), Some(ring.clone())).unwrap();

        let err = client.purchase_module(501, "stale", 3).await.unwrap_err();
        server.abort();

        match err {
            ClientError::UpstreamStatus { action, state } => {
                assert_eq!(action, PURCHASE_MODULE);
                assert_eq!(state, "invalid_auth");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
        assert_eq!(ring.live_count(), 1);
    }

    #[tokio::test]
    async fn dead_proxies_are_evicted_until_ring_is_empty() {
        let ring = Arc::new(ProxyRing::from_addresses(dead_addresses(2)));
        let client = UpstreamClient::new(config("http://game.invalid"), Some(ring.clone())).unwrap();

        let err = client.load_all(77, "code").await.unwrap_err();
        assert!(matches!(err, ClientError::EmptyRing(_)), "got {:?}", err);
        assert_eq!(ring.live_count(), 0);
    }

    #[tokio::test]
    async fn dead_proxy_is_skipped_for_live_one() {
        let (proxy, state, server) = start_mock_server().await;
        let mut addresses = dead_addresses(1);
        addresses.push(proxy.clone());
        let ring = Arc::new(ProxyRing::from_addresses(addresses));
        let client = UpstreamClient::new(config("http://game.invalid"), Some(ring.clone())).unwrap();

        for key in 1..=4_i64 {
            client.unseal_mails(key, "code", &[1, 2]).await.unwrap();
        }
        server.abort();

        assert_eq!(state.hits.load(Ordering::SeqCst), 4);
        assert!(ring
            .entries()
            .iter()
            .any(|e| e.address.as_deref() == Some(proxy.as_str())));
        assert!(ring.live_count() >= 1);
    }

    #[tokio::test]
    async fn retry_cap_bounds_attempts() {
        let ring = Arc::new(ProxyRing::from_addresses(dead_addresses(10)));
        let client = UpstreamClient::new(config("http://game.invalid"), Some(ring.clone())).unwrap();

        let err = client.exit_exp_dungeon(9, "code").await.unwrap_err();
        assert!(err.is_retryable(), "got {:?}", err);
        assert_eq!(ring.live_count(), 4);
    }

    #[test]
    fn check_state_requires_ok() {
        assert!(check_state(LOAD_ALL, &json!({ "state": "ok" })).is_ok());
        assert!(matches!(
            check_state(LOAD_ALL, &json!({})),
            Err(ClientError::UpstreamStatus { ref state, .. }) if state == "missing"
        ));
    }
}
