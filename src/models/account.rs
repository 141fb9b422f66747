use serde::{Deserialize, Serialize};

/// Persistent account record. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steam_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token_created_at: Option<i64>,
    #[serde(default)]
    pub auto_assemble_enabled: bool,
    #[serde(default)]
    pub last_run_at: i64,
    #[serde(default)]
    pub notification_sent: bool,
    pub created_at: i64,
}

impl Account {
    pub fn new(id: i64, display_name: String) -> Self {
        Self {
            id,
            display_name,
            language: None,
            steam_name: None,
            refresh_token: None,
            uid: None,
            public_uid: None,
            auth_token: None,
            auth_token_created_at: None,
            auto_assemble_enabled: false,
            last_run_at: 0,
            notification_sent: false,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Key used to pick this account's proxy on the ring.
    pub fn routing_key(&self) -> i64 {
        self.uid.unwrap_or(crate::constants::DEFAULT_ROUTING_KEY)
    }

    /// Upstream session credentials, if the account has a live session.
    pub fn session(&self) -> Option<(i64, &str)> {
        match (self.uid, self.auth_token.as_deref()) {
            (Some(uid), Some(token)) => Some((uid, token)),
            _ => None,
        }
    }

    /// True when the session token is missing or older than `ttl_secs`.
    pub fn token_is_stale(&self, now: i64, ttl_secs: i64) -> bool {
        if self.auth_token.is_none() {
            return true;
        }
        match self.auth_token_created_at {
            Some(created_at) => now - created_at > ttl_secs,
            None => true,
        }
    }
}

/// Field-level update applied to a stored account. `None` leaves a field
/// untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPatch {
    pub display_name: Option<String>,
    pub language: Option<Option<String>>,
    pub steam_name: Option<Option<String>>,
    pub refresh_token: Option<Option<String>>,
    pub uid: Option<Option<i64>>,
    pub public_uid: Option<Option<String>>,
    pub auth_token: Option<Option<String>>,
    pub auth_token_created_at: Option<Option<i64>>,
    pub auto_assemble_enabled: Option<bool>,
    pub last_run_at: Option<i64>,
    pub notification_sent: Option<bool>,
}

impl AccountPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn session(mut self, uid: i64, auth_token: String, created_at: i64) -> Self {
        self.uid = Some(Some(uid));
        self.auth_token = Some(Some(auth_token));
        self.auth_token_created_at = Some(Some(created_at));
        self
    }

    pub fn refresh_token(mut self, token: Option<String>) -> Self {
        self.refresh_token = Some(token);
        self
    }

    /// Drops both tokens, forcing a full login.
    pub fn clear_tokens(mut self) -> Self {
        self.refresh_token = Some(None);
        self.auth_token = Some(None);
        self
    }

    pub fn clear_auth_token(mut self) -> Self {
        self.auth_token = Some(None);
        self
    }

    pub fn run_started(mut self, now: i64) -> Self {
        self.last_run_at = Some(now);
        self.notification_sent = Some(false);
        self
    }

    pub fn notified(mut self) -> Self {
        self.notification_sent = Some(true);
        self
    }

    pub fn automation(mut self, enabled: bool) -> Self {
        self.auto_assemble_enabled = Some(enabled);
        self
    }

    pub fn steam_name(mut self, name: String) -> Self {
        self.steam_name = Some(Some(name));
        self
    }

    pub fn public_uid(mut self, public_uid: String) -> Self {
        self.public_uid = Some(Some(public_uid));
        self
    }

    pub fn language(mut self, language: Option<String>) -> Self {
        self.language = Some(language);
        self
    }

    pub fn apply(&self, account: &mut Account) {
        if let Some(v) = &self.display_name {
            account.display_name = v.clone();
        }
        if let Some(v) = &self.language {
            account.language = v.clone();
        }
        if let Some(v) = &self.steam_name {
            account.steam_name = v.clone();
        }
        if let Some(v) = &self.refresh_token {
            account.refresh_token = v.clone();
        }
        if let Some(v) = self.uid {
            account.uid = v;
        }
        if let Some(v) = &self.public_uid {
            account.public_uid = v.clone();
        }
        if let Some(v) = &self.auth_token {
            account.auth_token = v.clone();
        }
        if let Some(v) = self.auth_token_created_at {
            account.auth_token_created_at = v;
        }
        if let Some(v) = self.auto_assemble_enabled {
            account.auto_assemble_enabled = v;
        }
        if let Some(v) = self.last_run_at {
            account.last_run_at = v;
        }
        if let Some(v) = self.notification_sent {
            account.notification_sent = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_deserialize_with_missing_optional_fields() {
        let value = serde_json::json!({
            "id": 42,
            "display_name": "player",
            "created_at": 1_700_000_000
        });
        let parsed: Account = serde_json::from_value(value).expect("deserialize account");
        assert_eq!(parsed.id, 42);
        assert!(parsed.refresh_token.is_none());
        assert!(!parsed.auto_assemble_enabled);
        assert_eq!(parsed.last_run_at, 0);
    }

    #[test]
    fn token_staleness_honours_ttl() {
        let mut account = Account::new(1, "a".to_string());
        assert!(account.token_is_stale(1_000, 3600));

        account.auth_token = Some("code".to_string());
        account.auth_token_created_at = Some(1_000);
        assert!(!account.token_is_stale(1_000 + 3600, 3600));
        assert!(account.token_is_stale(1_000 + 3601, 3600));

        account.auth_token_created_at = None;
        assert!(account.token_is_stale(1_000, 3600));
    }

    #[test]
    fn routing_key_falls_back_without_uid() {
        let mut account = Account::new(7, "a".to_string());
        assert_eq!(account.routing_key(), crate::constants::DEFAULT_ROUTING_KEY);
        account.uid = Some(991);
        assert_eq!(account.routing_key(), 991);
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut account = Account::new(1, "a".to_string());
        account.refresh_token = Some("rt".to_string());
        account.auth_token = Some("at".to_string());
        account.auto_assemble_enabled = true;

        AccountPatch::new().clear_tokens().apply(&mut account);
        assert!(account.refresh_token.is_none());
        assert!(account.auth_token.is_none());
        assert!(account.auto_assemble_enabled);

        AccountPatch::new().run_started(500).apply(&mut account);
        assert_eq!(account.last_run_at, 500);
        assert!(!account.notification_sent);
        assert!(AccountPatch::new().is_empty());
    }
}
