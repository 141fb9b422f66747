// Account authentication state machine.
// Unauthenticated -> (password) -> [AwaitingSecondFactor ->] Authenticated,
// plus refresh-token renewal of expired sessions.

use crate::error::AuthError;
use crate::models::{Account, AccountPatch};
use crate::modules::auth::broker::{BrokerConnection, BrokerEndpoint, BrokerReply, BrokerRequest};
use crate::modules::auth::challenge::{ChallengeRegistry, PendingChallenge};
use crate::modules::persistence::account_db::AccountStore;
use crate::proxy::upstream::client::UpstreamClient;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingSecondFactor,
    Authenticated,
}

/// Result of a login step.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated(Account),
    SecondFactorRequired,
}

pub struct TokenLifecycleManager {
    store: Arc<dyn AccountStore>,
    client: Arc<UpstreamClient>,
    broker: BrokerEndpoint,
    challenges: Arc<ChallengeRegistry>,
    token_ttl_secs: i64,
    refresh_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        client: Arc<UpstreamClient>,
        broker: BrokerEndpoint,
        challenges: Arc<ChallengeRegistry>,
        token_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            client,
            broker,
            challenges,
            token_ttl_secs,
            refresh_locks: DashMap::new(),
        }
    }

    pub fn challenges(&self) -> &Arc<ChallengeRegistry> {
        &self.challenges
    }

    pub fn state(&self, account: &Account) -> AuthState {
        if self.challenges.is_pending(account.id) {
            AuthState::AwaitingSecondFactor
        } else if account.refresh_token.is_some() || account.session().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Starts a password login. A second-factor prompt parks the broker
    /// connection until [`Self::complete_second_factor`] is called.
    pub async fn begin_login(
        &self,
        account_id: i64,
        account_name: &str,
        password: &str,
    ) -> Result<LoginOutcome, AuthError> {
        self.store.require(account_id).await?;
        if self.challenges.discard(account_id) {
            tracing::debug!("Discarded stale challenge for account {}", account_id);
        }

        let (connection, reply) = self
            .broker
            .open(&BrokerRequest::password(account_name, password))
            .await?;
        self.handle_login_reply(account_id, account_name, connection, reply)
            .await
    }

    /// Sends the second-factor code over the parked connection. A wrong code
    /// keeps the challenge parked; any error means the login starts over.
    pub async fn complete_second_factor(
        &self,
        account_id: i64,
        code: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let PendingChallenge {
            mut connection,
            account_name,
            ..
        } = self
            .challenges
            .take(account_id)
            .ok_or(AuthError::ChallengeMissing(account_id))?;

        let reply = connection.exchange(&BrokerRequest::code(code)).await?;
        self.handle_login_reply(account_id, &account_name, connection, reply)
            .await
    }

    async fn handle_login_reply(
        &self,
        account_id: i64,
        account_name: &str,
        connection: BrokerConnection,
        reply: BrokerReply,
    ) -> Result<LoginOutcome, AuthError> {
        match reply {
            BrokerReply::Guard => {
                tracing::info!("Account {} is awaiting a second-factor code", account_id);
                self.challenges.insert(
                    account_id,
                    PendingChallenge::new(connection, account_name.to_string()),
                );
                Ok(LoginOutcome::SecondFactorRequired)
            }
            BrokerReply::Token {
                token,
                refresh_token,
            } => {
                drop(connection);
                let lock = self.refresh_lock(account_id);
                let _guard = lock.lock().await;

                // The broker has already consumed the credentials; keep its
                // refresh token even if the upstream sign-in below fails.
                let credentials = AccountPatch::new()
                    .refresh_token(refresh_token)
                    .steam_name(account_name.to_string());
                let account = self.store.update(account_id, &credentials).await?;

                let patch = self.sign_in(&account, &token).await?;
                let account = self.store.update(account_id, &patch).await?;
                tracing::info!("Account {} authenticated", account_id);
                Ok(LoginOutcome::Authenticated(account))
            }
        }
    }

    /// Exchanges a broker ticket for an upstream session and returns the
    /// patch recording it.
    async fn sign_in(&self, account: &Account, ticket: &str) -> Result<AccountPatch, AuthError> {
        let response = self.client.sign_in(ticket, account.routing_key()).await?;
        let session = response.result.user_auth;
        Ok(AccountPatch::new().session(
            session.uid,
            session.auth_code,
            chrono::Utc::now().timestamp(),
        ))
    }

    /// Every write to an account's tokens happens under this lock.
    fn refresh_lock(&self, account_id: i64) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn refresh_if_expired(&self, account_id: i64) -> Result<Account, AuthError> {
        self.refresh_if_expired_at(account_id, chrono::Utc::now().timestamp())
            .await
    }

    /// Renews the session through the stored refresh token when the auth
    /// token is missing or older than the TTL. Any failure on that path
    /// clears both tokens and yields [`AuthError::TokenExpired`].
    ///
    /// Serialized per account: a concurrent caller waits and then sees the
    /// already-refreshed record.
    pub async fn refresh_if_expired_at(&self, account_id: i64, now: i64) -> Result<Account, AuthError> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        let account = self.store.require(account_id).await?;
        if !account.token_is_stale(now, self.token_ttl_secs) {
            return Ok(account);
        }

        let Some(refresh_token) = account.refresh_token.clone() else {
            if account.auth_token.is_some() {
                self.store
                    .update(account_id, &AccountPatch::new().clear_auth_token())
                    .await?;
            }
            return Err(AuthError::TokenExpired("no refresh token stored".to_string()));
        };

        match self.renew(&account, &refresh_token).await {
            Ok(patch) => {
                let account = self.store.update(account_id, &patch).await?;
                tracing::debug!("Session renewed for account {}", account_id);
                Ok(account)
            }
            Err(e) => {
                tracing::warn!("Session renewal failed for account {}: {}", account_id, e);
                self.store
                    .update(account_id, &AccountPatch::new().clear_tokens())
                    .await?;
                Err(AuthError::TokenExpired(e.to_string()))
            }
        }
    }

    async fn renew(&self, account: &Account, refresh_token: &str) -> Result<AccountPatch, AuthError> {
        let (_connection, reply) = self.broker.open(&BrokerRequest::refresh(refresh_token)).await?;
        let (ticket, rotated) = match reply {
            BrokerReply::Token {
                token,
                refresh_token,
            } => (token, refresh_token),
            BrokerReply::Guard => {
                return Err(AuthError::Credential(
                    "broker asked for a second factor during refresh".to_string(),
                ))
            }
        };
        let mut patch = self.sign_in(account, &ticket).await?;
        if rotated.is_some() {
            patch = patch.refresh_token(rotated);
        }
        Ok(patch)
    }

    /// Returns the account with a live upstream session, renewing it first
    /// when needed.
    pub async fn ensure_session(&self, account_id: i64) -> Result<Account, AuthError> {
        let account = self.refresh_if_expired(account_id).await?;
        if account.session().is_none() {
            return Err(AuthError::NotAuthenticated(account_id));
        }
        Ok(account)
    }

    /// Drops the session token; the next call renews it.
    pub async fn invalidate_session(&self, account_id: i64) -> Result<Account, AuthError> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;
        Ok(self
            .store
            .update(account_id, &AccountPatch::new().clear_auth_token())
            .await?)
    }

    /// Forgets every credential of the account, including a parked challenge.
    /// Waits for an in-flight refresh so it cannot write the tokens back.
    pub async fn sign_out(&self, account_id: i64) -> Result<Account, AuthError> {
        self.challenges.discard(account_id);
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;
        Ok(self
            .store
            .update(account_id, &AccountPatch::new().clear_tokens())
            .await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::UpstreamConfig;
    use crate::modules::auth::broker::testing::{start, MockBroker, MockBrokerConfig};
    use crate::modules::persistence::account_db::SqliteAccountStore;
    use axum::{extract::State, http::Uri, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Upstream mock: signs in any ticket, reports configurable stamina and
    /// records purchases.
    #[derive(Clone, Default)]
    pub struct GameState {
        pub sign_ins: Arc<AtomicUsize>,
        pub purchased: Arc<AtomicI64>,
        pub stamina: Arc<AtomicI64>,
        pub reject_sign_in: Arc<AtomicBool>,
        pub reject_load: Arc<AtomicBool>,
        pub calls: Arc<tokio::sync::Mutex<Vec<(String, Value)>>>,
    }

    async fn handler(State(state): State<GameState>, uri: Uri, Json(body): Json<Value>) -> Json<Value> {
        let path = uri.path().trim_start_matches('/').to_string();
        state.calls.lock().await.push((path.clone(), body.clone()));
        match path.as_str() {
            "login/SignInAsSteam" => {
                if state.reject_sign_in.load(Ordering::SeqCst) {
                    return Json(json!({ "state": "invalid_ticket" }));
                }
                let n = state.sign_ins.fetch_add(1, Ordering::SeqCst) + 1;
                Json(json!({
                    "state": "ok",
                    "result": { "userAuth": { "uid": 900, "auth_code": format!("session-{}", n) } }
                }))
            }
            "api/LoadUserDataAll" if state.reject_load.load(Ordering::SeqCst) => {
                Json(json!({ "state": "maintenance" }))
            }
            "api/LoadUserDataAll" => Json(json!({
                "state": "ok",
                "updated": {
                    "userInfo": { "uid": 900, "level": 40, "stamina": state.stamina.load(Ordering::SeqCst) },
                    "mailList": [{ "mail_id": 11 }, { "mail_id": 12 }]
                },
                "result": { "profile": { "public_uid": "PUB-900", "level": 40 } }
            })),
            "api/PurchaseEnkephalinModule" => {
                let num = body.pointer("/parameters/num").and_then(|v| v.as_i64()).unwrap_or(0);
                state.purchased.fetch_add(num, Ordering::SeqCst);
                Json(json!({ "state": "ok" }))
            }
            _ => Json(json!({ "state": "ok" })),
        }
    }

    pub struct Harness {
        pub store: Arc<SqliteAccountStore>,
        pub manager: Arc<TokenLifecycleManager>,
        pub client: Arc<UpstreamClient>,
        pub game: GameState,
        pub broker: MockBroker,
        server: tokio::task::JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.server.abort();
        }
    }

    pub async fn harness(broker_config: MockBrokerConfig) -> Harness {
        let game = GameState::default();
        let app = Router::new()
            .route("/*path", post(handler))
            .with_state(game.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let upstream = UpstreamConfig {
            base_url: format!("http://{}", addr),
            request_timeout_secs: 5,
            ..UpstreamConfig::default()
        };
        let client = Arc::new(UpstreamClient::new(upstream, None).expect("client"));
        let store = Arc::new(SqliteAccountStore::open_in_memory().expect("store"));
        let broker = start(broker_config).await;
        let manager = Arc::new(TokenLifecycleManager::new(
            store.clone(),
            client.clone(),
            broker.endpoint.clone(),
            Arc::new(ChallengeRegistry::new(Duration::from_secs(60))),
            3600,
        ));
        Harness {
            store,
            manager,
            client,
            game,
            broker,
            server,
        }
    }
}
