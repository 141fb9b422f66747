use crate::commands::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountPatch};
use crate::modules::auth::lifecycle::LoginOutcome;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Bounds of the in-game timed activity, in seconds.
const EXP_DUNGEON_MIN_SECS: u64 = 5 * 60;
const EXP_DUNGEON_MAX_SECS: u64 = 7 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStep {
    Authenticated,
    SecondFactorRequired,
}

impl From<LoginOutcome> for LoginStep {
    fn from(outcome: LoginOutcome) -> Self {
        match outcome {
            LoginOutcome::Authenticated(_) => LoginStep::Authenticated,
            LoginOutcome::SecondFactorRequired => LoginStep::SecondFactorRequired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub steam_name: Option<String>,
    pub public_uid: String,
    pub level: i64,
    pub stamina: i64,
    pub pending_mail: usize,
}

fn session_of(account: &Account) -> AppResult<(i64, &str)> {
    account
        .session()
        .ok_or_else(|| AppError::Account(format!("account {} has no session", account.id)))
}

pub async fn ensure_account(state: &AppState, id: i64, display_name: &str) -> AppResult<Account> {
    Ok(state.store.ensure(id, display_name).await?)
}

/// Maps a picker choice ("English", "Русский" or a locale code) to the
/// stored locale.
fn locale_of(choice: &str) -> Option<&'static str> {
    match choice.trim().to_lowercase().as_str() {
        "en" | "english" => Some("en"),
        "ru" | "русский" => Some("ru"),
        _ => None,
    }
}

pub async fn set_language(state: &AppState, id: i64, choice: &str) -> AppResult<Account> {
    let locale = locale_of(choice)
        .ok_or_else(|| AppError::Account(format!("unknown language: {}", choice.trim())))?;
    Ok(state
        .store
        .update(id, &AccountPatch::new().language(Some(locale.to_string())))
        .await?)
}

pub async fn begin_login(
    state: &AppState,
    id: i64,
    account_name: &str,
    password: &str,
) -> AppResult<LoginStep> {
    let account_name = account_name.trim();
    if account_name.is_empty() {
        return Err(AppError::Account("account name must not be empty".to_string()));
    }
    Ok(state
        .auth
        .begin_login(id, account_name, password)
        .await?
        .into())
}

pub async fn submit_guard_code(state: &AppState, id: i64, code: &str) -> AppResult<LoginStep> {
    Ok(state.auth.complete_second_factor(id, code).await?.into())
}

pub async fn overview(state: &AppState, id: i64) -> AppResult<Overview> {
    let account = state.auth.ensure_session(id).await?;
    let (uid, auth_code) = session_of(&account)?;
    let data = state.client.load_all(uid, auth_code).await?;
    let profile = data.result.profile;

    if account.public_uid.as_deref() != Some(profile.public_uid.as_str()) {
        state
            .store
            .update(id, &AccountPatch::new().public_uid(profile.public_uid.clone()))
            .await?;
    }

    Ok(Overview {
        steam_name: account.steam_name.clone(),
        public_uid: profile.public_uid,
        level: profile.level,
        stamina: data.updated.user_info.stamina,
        pending_mail: data.updated.mail_list.len(),
    })
}

pub async fn assemble_modules(state: &AppState, id: i64, num: i64) -> AppResult<i64> {
    if num <= 0 {
        return Err(AppError::Account("module count must be positive".to_string()));
    }
    let account = state.auth.ensure_session(id).await?;
    let (uid, auth_code) = session_of(&account)?;
    state.client.purchase_module(uid, auth_code, num).await?;
    tracing::info!(account_id = id, "Assembled {} module(s) on request", num);
    Ok(num)
}

fn exp_dungeon_wait() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(EXP_DUNGEON_MIN_SECS..=EXP_DUNGEON_MAX_SECS))
}

pub async fn run_exp_dungeon(state: &AppState, id: i64, dungeon_id: i64) -> AppResult<()> {
    run_exp_dungeon_with_wait(state, id, dungeon_id, exp_dungeon_wait()).await
}

/// Enters the dungeon, stays for `wait`, then leaves with a win.
pub async fn run_exp_dungeon_with_wait(
    state: &AppState,
    id: i64,
    dungeon_id: i64,
    wait: Duration,
) -> AppResult<()> {
    let account = state.auth.ensure_session(id).await?;
    let (uid, auth_code) = session_of(&account)?;
    state.client.enter_exp_dungeon(uid, auth_code, dungeon_id).await?;
    tracing::info!(account_id = id, "Entered exp dungeon {}, leaving in {:?}", dungeon_id, wait);
    tokio::time::sleep(wait).await;

    // The session may have aged out while waiting.
    let account = state.auth.ensure_session(id).await?;
    let (uid, auth_code) = session_of(&account)?;
    state.client.exit_exp_dungeon(uid, auth_code).await?;
    Ok(())
}

/// Unseals every mail in the mailbox; returns how many were opened.
pub async fn claim_mail(state: &AppState, id: i64) -> AppResult<usize> {
    let account = state.auth.ensure_session(id).await?;
    let (uid, auth_code) = session_of(&account)?;
    let data = state.client.load_all(uid, auth_code).await?;
    let mail_ids: Vec<i64> = data.updated.mail_list.iter().map(|m| m.mail_id).collect();
    if mail_ids.is_empty() {
        return Ok(0);
    }
    state.client.unseal_mails(uid, auth_code, &mail_ids).await?;
    Ok(mail_ids.len())
}

pub async fn toggle_automation(state: &AppState, id: i64) -> AppResult<bool> {
    let account = state.store.require(id).await?;
    let enabled = !account.auto_assemble_enabled;
    state
        .store
        .update(id, &AccountPatch::new().automation(enabled))
        .await?;
    tracing::info!(account_id = id, "Automation {}", if enabled { "enabled" } else { "disabled" });
    Ok(enabled)
}

/// Pushes the next automated run a full interval out.
pub async fn postpone(state: &AppState, id: i64) -> AppResult<Account> {
    let now = chrono::Utc::now().timestamp();
    Ok(state
        .store
        .update(id, &AccountPatch::new().run_started(now))
        .await?)
}

pub async fn relogin(state: &AppState, id: i64) -> AppResult<Account> {
    Ok(state.auth.invalidate_session(id).await?)
}

pub async fn logout(state: &AppState, id: i64) -> AppResult<Account> {
    Ok(state.auth.sign_out(id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::modules::auth::broker::testing::MockBrokerConfig;
    use crate::modules::auth::lifecycle::testing::{harness, Harness};
    use crate::modules::persistence::account_db::AccountStore;
    use std::sync::atomic::Ordering;

    fn app_state(h: &Harness) -> AppState {
        AppState::new(h.store.clone(), h.manager.clone(), h.client.clone())
    }

    async fn signed_in(h: &Harness, id: i64) -> AppState {
        let state = app_state(h);
        ensure_account(&state, id, "player").await.unwrap();
        assert_eq!(
            begin_login(&state, id, "gamer", "hunter2").await.unwrap(),
            LoginStep::Authenticated
        );
        state
    }

    #[tokio::test]
    async fn guarded_login_flow() {
        let h = harness(MockBrokerConfig {
            guard_code: Some("G1".to_string()),
            ..MockBrokerConfig::default()
        })
        .await;
        let state = app_state(&h);
        ensure_account(&state, 1, "player").await.unwrap();

        assert_eq!(
            begin_login(&state, 1, "gamer", "hunter2").await.unwrap(),
            LoginStep::SecondFactorRequired
        );
        assert_eq!(
            submit_guard_code(&state, 1, "nope").await.unwrap(),
            LoginStep::SecondFactorRequired
        );
        assert_eq!(
            submit_guard_code(&state, 1, "G1").await.unwrap(),
            LoginStep::Authenticated
        );
    }

    #[tokio::test]
    async fn blank_account_name_is_rejected() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = app_state(&h);
        ensure_account(&state, 1, "player").await.unwrap();
        assert!(matches!(
            begin_login(&state, 1, "  ", "pw").await,
            Err(AppError::Account(_))
        ));
    }

    #[tokio::test]
    async fn overview_reports_profile_and_stores_public_uid() {
        let h = harness(MockBrokerConfig::default()).await;
        h.game.stamina.store(42, Ordering::SeqCst);
        let state = signed_in(&h, 2).await;

        let overview = overview(&state, 2).await.unwrap();
        assert_eq!(overview.public_uid, "PUB-900");
        assert_eq!(overview.level, 40);
        assert_eq!(overview.stamina, 42);
        assert_eq!(overview.pending_mail, 2);
        assert_eq!(overview.steam_name.as_deref(), Some("gamer"));
        assert_eq!(
            h.store.require(2).await.unwrap().public_uid.as_deref(),
            Some("PUB-900")
        );
    }

    #[tokio::test]
    async fn assemble_and_claim_mail() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = signed_in(&h, 3).await;

        assert_eq!(assemble_modules(&state, 3, 4).await.unwrap(), 4);
        assert_eq!(h.game.purchased.load(Ordering::SeqCst), 4);
        assert!(assemble_modules(&state, 3, 0).await.is_err());

        assert_eq!(claim_mail(&state, 3).await.unwrap(), 2);
        let calls = h.game.calls.lock().await;
        let (_, body) = calls
            .iter()
            .find(|(path, _)| path == "api/UnsealMails")
            .expect("unseal call");
        assert_eq!(body.pointer("/parameters/mailIds").unwrap(), &serde_json::json!([11, 12]));
    }

    #[tokio::test]
    async fn exp_dungeon_enters_then_exits() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = signed_in(&h, 4).await;

        run_exp_dungeon_with_wait(&state, 4, 7, Duration::from_millis(10))
            .await
            .unwrap();
        let calls = h.game.calls.lock().await;
        let paths: Vec<&str> = calls.iter().map(|(p, _)| p.as_str()).collect();
        let enter = paths.iter().position(|p| *p == "api/EnterExpDungeon").unwrap();
        let exit = paths.iter().position(|p| *p == "api/ExitExpDungeon").unwrap();
        assert!(enter < exit);
        assert_eq!(calls[enter].1.pointer("/parameters/dungeonid").unwrap(), 7);
        assert_eq!(calls[exit].1.pointer("/parameters/isWin").unwrap(), 1);
    }

    #[test]
    fn exp_dungeon_wait_is_within_bounds() {
        for _ in 0..50 {
            let wait = exp_dungeon_wait().as_secs();
            assert!((EXP_DUNGEON_MIN_SECS..=EXP_DUNGEON_MAX_SECS).contains(&wait));
        }
    }

    #[tokio::test]
    async fn automation_toggle_and_postpone() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = app_state(&h);
        ensure_account(&state, 5, "player").await.unwrap();

        assert!(toggle_automation(&state, 5).await.unwrap());
        assert!(!toggle_automation(&state, 5).await.unwrap());

        h.store.update(5, &AccountPatch::new().notified()).await.unwrap();
        let before = chrono::Utc::now().timestamp();
        let account = postpone(&state, 5).await.unwrap();
        assert!(account.last_run_at >= before);
        assert!(!account.notification_sent);
    }

    #[tokio::test]
    async fn language_choice_is_stored_as_locale() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = app_state(&h);
        ensure_account(&state, 7, "player").await.unwrap();

        let account = set_language(&state, 7, "English").await.unwrap();
        assert_eq!(account.language.as_deref(), Some("en"));
        let account = set_language(&state, 7, " Русский ").await.unwrap();
        assert_eq!(account.language.as_deref(), Some("ru"));

        assert!(matches!(
            set_language(&state, 7, "klingon").await,
            Err(AppError::Account(_))
        ));
        assert_eq!(h.store.require(7).await.unwrap().language.as_deref(), Some("ru"));
    }

    #[tokio::test]
    async fn relogin_renews_and_logout_requires_login() {
        let h = harness(MockBrokerConfig::default()).await;
        let state = signed_in(&h, 6).await;

        let account = relogin(&state, 6).await.unwrap();
        assert!(account.auth_token.is_none());
        assert!(account.refresh_token.is_some());
        overview(&state, 6).await.unwrap();
        assert_eq!(h.game.sign_ins.load(Ordering::SeqCst), 2);

        logout(&state, 6).await.unwrap();
        assert!(matches!(
            overview(&state, 6).await,
            Err(AppError::Auth(AuthError::TokenExpired(_)))
        ));
    }
}
